//! Shell commands.
//!
//! Each input line is parsed into a [`Command`], run against the [`Agent`],
//! and answered with a [`Reply`] carrying the text to print and the exit
//! status (0 on success, 1 on failure).

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::error::{AgentError, AgentResult};
use crate::payload::{self, Payload};
use crate::selection::SelectionState;
use crate::simulate;
use crate::subscriptions::{DeliveryHandler, Publication, SharedSubscriptions};
use crate::transport::mac::{MacParam, MacSettings, MacValue};
use crate::transport::{
    Delivery, JoinMode, Port, TopicName, Transmit, TransmitOptions, Transport, TxReport, Will,
};
use crate::types::{default_stations, QoS, SensorKind, Station};

#[derive(Debug, Parser)]
#[command(name = "weather-node", no_binary_name = true, disable_version_flag = true)]
pub struct ShellLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to a broker gateway
    #[command(name = "con")]
    Con {
        /// Gateway address
        addr: IpAddr,
        /// Gateway port
        port: Option<u16>,
        /// Last will topic
        #[arg(requires = "will_message")]
        will_topic: Option<String>,
        /// Last will message
        will_message: Option<String>,
    },

    /// Disconnect from the current broker
    #[command(name = "discon")]
    Discon,

    /// Publish raw data to a topic
    #[command(name = "pub")]
    Pub {
        topic: String,
        data: String,
        /// QoS level (0, 1 or 2)
        qos: Option<u8>,
    },

    /// Subscribe to a topic
    #[command(name = "sub")]
    Sub { topic: String, qos: Option<u8> },

    /// Unsubscribe from a topic
    #[command(name = "unsub")]
    Unsub { topic: String },

    /// Register a last will
    #[command(name = "will")]
    Will { topic: String, message: String },

    /// Control the LoRaMAC stack
    #[command(subcommand)]
    Loramac(LoramacCommand),

    /// Select the sensor of a weather station this node reports for
    #[command(name = "initSensor")]
    InitSensor { station: String, sensor: String },

    /// Show a payload for the selected sensor
    #[command(name = "printPay")]
    PrintPay,

    /// Build a payload for the selected sensor and send it
    #[command(name = "sendPayload")]
    SendPayload {
        /// Topic to publish on (broker transport only)
        topic: Option<String>,
        qos: Option<u8>,
    },

    /// Print a fresh value for every sensor kind
    #[command(name = "readEnv")]
    ReadEnv,

    /// List the configured weather stations
    #[command(name = "stations")]
    Stations,
}

#[derive(Debug, Subcommand)]
pub enum LoramacCommand {
    /// Read a MAC parameter
    Get { param: String },
    /// Write a MAC parameter
    Set { param: String, value: String },
    /// Join the network (otaa or abp)
    Join { mode: String },
    /// Send raw data: <payload> [cnf|uncnf] [port]
    Tx {
        payload: String,
        mode: Option<String>,
        port: Option<u16>,
    },
    /// Schedule a link check with the next uplink
    #[command(name = "link_check")]
    LinkCheck,
    /// Persist the MAC parameters
    Save,
    /// Erase persisted MAC parameters
    Erase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: i32,
    pub text: String,
}

impl Reply {
    fn ok(text: String) -> Self {
        Self { status: 0, text }
    }

    fn failed(text: String) -> Self {
        Self { status: 1, text }
    }
}

/// Delivery handler that prints inbound publications to stdout.
pub fn print_publication() -> DeliveryHandler {
    std::sync::Arc::new(|p: &Publication<'_>| {
        println!(
            "### got publication for topic '{}' [{}] ###\n{}",
            p.topic_name,
            p.topic_id,
            String::from_utf8_lossy(p.payload)
        );
    })
}

/// Everything the shell operates on.
pub struct Agent {
    stations: [Station; 2],
    selection: SelectionState,
    transport: Transport,
    subscriptions: SharedSubscriptions,
    broker_port: u16,
    config_dir: PathBuf,
    rng: StdRng,
}

impl Agent {
    pub fn new(
        transport: Transport,
        subscriptions: SharedSubscriptions,
        broker_port: u16,
        config_dir: PathBuf,
        rng: StdRng,
    ) -> Self {
        Self {
            stations: default_stations(),
            selection: SelectionState::new(),
            transport,
            subscriptions,
            broker_port,
            config_dir,
            rng,
        }
    }

    /// Parses and runs one shell line. Blank lines yield `None`.
    pub fn handle_line(&mut self, line: &str) -> Option<Reply> {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            return None;
        }
        let reply = match ShellLine::try_parse_from(words) {
            Ok(parsed) => match self.execute(parsed.command) {
                Ok(text) => Reply::ok(text),
                Err(e) => {
                    debug!(error = %e, class = ?e.class(), "Command failed");
                    Reply::failed(format!("error: {e}"))
                }
            },
            Err(e) => {
                let text = e.render().to_string().trim_end().to_string();
                if e.use_stderr() {
                    Reply::failed(text)
                } else {
                    Reply::ok(text)
                }
            }
        };
        Some(reply)
    }

    pub fn execute(&mut self, command: Command) -> AgentResult<String> {
        match command {
            Command::Con {
                addr,
                port,
                will_topic,
                will_message,
            } => self.connect(addr, port, will_topic.zip(will_message)),
            Command::Discon => {
                let broker = self.transport.broker("discon")?;
                let gateway = broker.gateway();
                broker.disconnect().into_result()?;
                Ok(match gateway {
                    Some(gateway) => format!("Disconnected from gateway at {gateway}"),
                    None => "Disconnect successful".to_string(),
                })
            }
            Command::Pub { topic, data, qos } => {
                let topic = TopicName::new(&topic)?;
                let qos = qos.map(QoS::from_level).unwrap_or_default();
                let topic_id = self
                    .transport
                    .broker("pub")?
                    .publish(&topic, data.as_bytes(), qos)
                    .into_result()?;
                Ok(format!(
                    "Published {} bytes to topic '{topic} [{topic_id}]'",
                    data.len()
                ))
            }
            Command::Sub { topic, qos } => {
                let qos = qos.map(QoS::from_level).unwrap_or_default();
                let broker = self.transport.broker("sub")?;
                let slot = self.subscriptions.lock().subscribe(broker, &topic, qos)?;
                Ok(format!(
                    "Now subscribed to {topic} [{}] in slot {}",
                    slot.topic_id, slot.index
                ))
            }
            Command::Unsub { topic } => {
                let broker = self.transport.broker("unsub")?;
                self.subscriptions.lock().unsubscribe(broker, &topic)?;
                Ok(format!("Unsubscribed from '{topic}'"))
            }
            Command::Will { topic, message } => {
                let will = Will {
                    topic,
                    message: message.into_bytes(),
                };
                self.transport.broker("will")?.update_will(&will).into_result()?;
                Ok("Successfully updated last will topic and message".to_string())
            }
            Command::Loramac(cmd) => self.loramac(cmd),
            Command::InitSensor { station, sensor } => {
                let reading =
                    self.selection
                        .select(&mut self.stations, &station, &sensor, &mut self.rng)?;
                Ok(format!(
                    "sensor: {} of weather station {station} selected ({}: {})",
                    reading.name,
                    reading.kind,
                    payload::format_value(reading.value)
                ))
            }
            Command::PrintPay => Ok(self.build_payload()?.to_string()),
            Command::SendPayload { topic, qos } => self.send_payload(topic, qos),
            Command::ReadEnv => Ok(self.read_env()),
            Command::Stations => Ok(self.describe_stations()),
        }
    }

    fn connect(
        &mut self,
        addr: IpAddr,
        port: Option<u16>,
        will: Option<(String, String)>,
    ) -> AgentResult<String> {
        let gateway = SocketAddr::new(addr, port.unwrap_or(self.broker_port));
        let will = will.map(|(topic, message)| Will {
            topic,
            message: message.into_bytes(),
        });
        self.transport
            .broker("con")?
            .connect(gateway, true, will.as_ref())
            .into_result()?;
        // A clean session starts with no subscriptions on the gateway.
        let dropped = self.subscriptions.lock().clear();
        if dropped > 0 {
            info!(dropped, %gateway, "Clean session discarded previous subscriptions");
        }
        Ok(format!("Successfully connected to gateway at {gateway}"))
    }

    fn build_payload(&mut self) -> AgentResult<Payload> {
        let reading = self.selection.current()?;
        payload::encode(reading, Utc::now(), &mut self.rng)
    }

    fn send_payload(&mut self, topic: Option<String>, qos: Option<u8>) -> AgentResult<String> {
        let options = match &self.transport {
            Transport::Broker(_) => {
                let topic = topic
                    .ok_or_else(|| AgentError::invalid("usage: sendPayload <topic name> [QoS level]"))?;
                TransmitOptions::topic(
                    TopicName::new(&topic)?,
                    qos.map(QoS::from_level).unwrap_or_default(),
                )
            }
            Transport::Mac(_) => {
                if topic.is_some() || qos.is_some() {
                    return Err(AgentError::invalid(
                        "usage: sendPayload (no arguments on the mac transport)",
                    ));
                }
                TransmitOptions::lora(true, Port::DEFAULT)
            }
        };
        let payload = self.build_payload()?;

        let delivery = self
            .transport
            .transmit(payload.as_bytes(), &options)?
            .into_result()?;
        info!(len = payload.len(), transport = self.transport.kind().as_str(), "Payload sent");

        let mut out = payload.to_string();
        match delivery {
            Delivery::Published {
                topic,
                topic_id,
                bytes,
            } => {
                let _ = write!(out, "\nPublished {bytes} bytes to topic '{topic} [{topic_id}]'");
            }
            Delivery::Sent(report) => {
                out.push('\n');
                out.push_str(&describe_tx(&report));
            }
        }
        Ok(out)
    }

    fn loramac(&mut self, cmd: LoramacCommand) -> AgentResult<String> {
        let mac = self.transport.mac("loramac")?;
        match cmd {
            LoramacCommand::Get { param } => {
                let param = MacParam::parse(&param)?;
                Ok(mac.settings().describe(param))
            }
            LoramacCommand::Set { param, value } => {
                let param = MacParam::parse(&param)?;
                let value = MacValue::parse(param, &value)?;
                mac.set(&value);
                Ok(mac.settings().describe(param))
            }
            LoramacCommand::Join { mode } => {
                mac.join(JoinMode::parse(&mode)?).into_result()?;
                Ok("Join procedure succeeded!".to_string())
            }
            LoramacCommand::Tx {
                payload,
                mode,
                port,
            } => {
                let confirmed = match mode.as_deref() {
                    None | Some("cnf") => true,
                    Some("uncnf") => false,
                    Some(_) => {
                        return Err(AgentError::invalid(
                            "Usage: loramac tx <payload> [<cnf|uncnf>] [port]",
                        ))
                    }
                };
                let port = port.map(Port::new).transpose()?.unwrap_or_default();
                let report = mac.send(payload.as_bytes(), confirmed, port).into_result()?;
                Ok(describe_tx(&report))
            }
            LoramacCommand::LinkCheck => {
                mac.request_link_check();
                Ok("Link check request scheduled".to_string())
            }
            LoramacCommand::Save => {
                let path = mac
                    .settings()
                    .save_to_dir(&self.config_dir)
                    .map_err(|e| AgentError::Storage(e.to_string()))?;
                Ok(format!("MAC settings saved to {}", path.display()))
            }
            LoramacCommand::Erase => {
                let erased = MacSettings::erase_in_dir(&self.config_dir)
                    .map_err(|e| AgentError::Storage(e.to_string()))?;
                Ok(if erased {
                    "Saved MAC settings erased".to_string()
                } else {
                    "No saved MAC settings".to_string()
                })
            }
        }
    }

    fn read_env(&mut self) -> String {
        SensorKind::ALL
            .iter()
            .map(|kind| {
                let value = simulate::sample(*kind, &mut self.rng);
                format!("{kind} is: {value:.6} {}", kind.unit())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn describe_stations(&self) -> String {
        let mut out = String::new();
        for station in &self.stations {
            let _ = writeln!(out, "Weather station: {}", station.name);
            for s in &station.sensors {
                let _ = writeln!(out, "  {} {} {} {:.6}", s.id, s.name, s.kind, s.value);
            }
        }
        out.trim_end().to_string()
    }
}

fn describe_tx(report: &TxReport) -> String {
    let mut out = match &report.downlink {
        Some(d) => format!(
            "Data received: {}, port: {}",
            String::from_utf8_lossy(&d.payload),
            d.port
        ),
        None => "TX complete, no data received".to_string(),
    };
    if let Some(link) = report.link_check {
        let _ = write!(
            out,
            "\nLink check information:\n  - Demodulation margin: {}\n  - Number of gateways: {}",
            link.demod_margin, link.gateways
        );
    }
    out
}
