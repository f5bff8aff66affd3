use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod engine;
mod error;
mod payload;
mod selection;
mod simulate;
mod subscriptions;
mod transport;
mod types;

use commands::Agent;
use config::Config;
use subscriptions::{SharedSubscriptions, SubscriptionTable};
use transport::mac::MacSettings;
use transport::sim::{LoopbackBroker, SimulatedMac};
use transport::{BrokerTransport, MacTransport, Transport, TransportKind};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the shell.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    info!(?config, "Weather node starting");

    let subscriptions = SharedSubscriptions::new(
        SubscriptionTable::new(commands::print_publication()).strict(config.strict_subscriptions),
    );

    let (transport, engine) = match config.transport {
        TransportKind::Broker => {
            let (tx, rx) = mpsc::unbounded_channel();
            let stack = LoopbackBroker::new(config.node_id.clone(), tx);
            let engine = tokio::spawn(engine::run(rx, subscriptions.clone()));
            (Transport::Broker(BrokerTransport::new(Box::new(stack))), Some(engine))
        }
        TransportKind::Mac => {
            let settings = match MacSettings::load_from_dir(&config.config_dir)? {
                Some(settings) => {
                    info!(path = %config.mac_settings_path().display(), "Loaded saved MAC settings");
                    settings
                }
                None => MacSettings::default(),
            };
            let stack = SimulatedMac::new(settings)
                .with_uplink_interval(Duration::from_millis(config.mac_uplink_interval_ms));
            (Transport::Mac(MacTransport::new(Box::new(stack))), None)
        }
    };
    info!(transport = transport.kind().as_str(), "Transport ready");

    let mut agent = Agent::new(
        transport,
        subscriptions,
        config.broker_port,
        config.config_dir.clone(),
        StdRng::from_entropy(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if let Some(reply) = agent.handle_line(&line) {
            if !reply.text.is_empty() {
                println!("{}", reply.text);
            }
            if reply.status != 0 {
                warn!(command = line.trim(), status = reply.status, "Command failed");
            }
        }
    }

    // Dropping the agent drops the broker stack and closes the inbound channel.
    drop(agent);
    if let Some(engine) = engine {
        let delivered = engine.await?;
        info!(delivered, "Inbound engine joined");
    }
    info!("Weather node stopped");
    Ok(())
}
