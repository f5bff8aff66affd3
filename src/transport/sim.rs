//! In-process stand-ins for the protocol stacks.
//!
//! [`LoopbackBroker`] behaves like a gateway that echoes every publication
//! back to matching subscriptions. [`SimulatedMac`] behaves like a network
//! server that accepts joins and uplinks, answers every confirmed uplink with
//! a downlink carrying the same bytes on the same port, and enforces a
//! minimum interval between uplinks.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::broker::{BrokerCode, BrokerStack, Inbound, Will};
use super::mac::{Downlink, JoinMode, LinkCheck, MacSettings, MacStack, MacStatus, MacValue};
use crate::types::QoS;

pub struct LoopbackBroker {
    client_id: String,
    gateway: Option<SocketAddr>,
    will: Option<Will>,
    topics: HashMap<String, u16>,
    subscribed: HashMap<u16, String>,
    next_id: u16,
    inbound: UnboundedSender<Inbound>,
}

impl LoopbackBroker {
    pub fn new(client_id: impl Into<String>, inbound: UnboundedSender<Inbound>) -> Self {
        Self {
            client_id: client_id.into(),
            gateway: None,
            will: None,
            topics: HashMap::new(),
            subscribed: HashMap::new(),
            next_id: 1,
            inbound,
        }
    }

    fn topic_id(&mut self, name: &str) -> u16 {
        if let Some(id) = self.topics.get(name) {
            return *id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.topics.insert(name.to_string(), id);
        id
    }
}

impl BrokerStack for LoopbackBroker {
    fn connect(&mut self, gateway: SocketAddr, clean: bool, will: Option<&Will>) -> BrokerCode {
        if self.gateway.is_some() {
            return BrokerCode::NoGateway;
        }
        debug!(client_id = %self.client_id, %gateway, clean, "Loopback session opened");
        if clean {
            self.subscribed.clear();
        }
        self.gateway = Some(gateway);
        self.will = will.cloned();
        BrokerCode::Ok
    }

    fn disconnect(&mut self) -> BrokerCode {
        match self.gateway.take() {
            Some(_) => BrokerCode::Ok,
            None => BrokerCode::NoGateway,
        }
    }

    fn register_topic(&mut self, name: &str) -> Result<u16, BrokerCode> {
        if self.gateway.is_none() {
            return Err(BrokerCode::NoGateway);
        }
        Ok(self.topic_id(name))
    }

    fn publish(&mut self, topic_id: u16, data: &[u8], _qos: QoS) -> BrokerCode {
        if self.gateway.is_none() {
            return BrokerCode::NoGateway;
        }
        if let Some(name) = self.subscribed.get(&topic_id) {
            let message = Inbound {
                topic_id,
                topic_name: Some(name.clone()),
                payload: data.to_vec(),
            };
            if self.inbound.send(message).is_err() {
                warn!(topic_id, "Inbound channel closed, publication not echoed");
            }
        }
        BrokerCode::Ok
    }

    fn subscribe(&mut self, name: &str, _qos: QoS) -> Result<u16, BrokerCode> {
        if self.gateway.is_none() {
            return Err(BrokerCode::NoGateway);
        }
        let id = self.topic_id(name);
        self.subscribed.insert(id, name.to_string());
        Ok(id)
    }

    fn unsubscribe(&mut self, topic_id: u16) -> BrokerCode {
        if self.gateway.is_none() {
            return BrokerCode::NoGateway;
        }
        match self.subscribed.remove(&topic_id) {
            Some(_) => BrokerCode::Ok,
            None => BrokerCode::Error,
        }
    }

    fn update_will_topic(&mut self, topic: &str, _qos: QoS) -> BrokerCode {
        if self.gateway.is_none() {
            return BrokerCode::NoGateway;
        }
        let will = self.will.get_or_insert_with(|| Will {
            topic: String::new(),
            message: Vec::new(),
        });
        will.topic = topic.to_string();
        BrokerCode::Ok
    }

    fn update_will_message(&mut self, message: &[u8]) -> BrokerCode {
        match (self.gateway, self.will.as_mut()) {
            (None, _) => BrokerCode::NoGateway,
            (Some(_), Some(will)) => {
                will.message = message.to_vec();
                BrokerCode::Ok
            }
            (Some(_), None) => BrokerCode::Error,
        }
    }
}

#[derive(Default)]
pub struct SimulatedMac {
    settings: MacSettings,
    joined: bool,
    pending_uplink: bool,
    link_check_requested: bool,
    link_check: LinkCheck,
    downlinks: VecDeque<Downlink>,
    uplink_interval: Duration,
    last_uplink: Option<Instant>,
}

impl SimulatedMac {
    pub fn new(settings: MacSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Uplinks closer together than `interval` are refused with a duty-cycle
    /// restriction.
    pub fn with_uplink_interval(mut self, interval: Duration) -> Self {
        self.uplink_interval = interval;
        self
    }

    /// Queues a downlink for the next receive window.
    pub fn queue_downlink(&mut self, downlink: Downlink) {
        self.downlinks.push_back(downlink);
    }
}

impl MacStack for SimulatedMac {
    fn init(&mut self) {
        self.joined = false;
        self.pending_uplink = false;
        self.link_check = LinkCheck::default();
    }

    fn join(&mut self, mode: JoinMode) -> MacStatus {
        if self.joined {
            return MacStatus::AlreadyJoined;
        }
        // ABP needs session keys and an address, OTAA needs an app key.
        let provisioned = match mode {
            JoinMode::Otaa => self.settings.app_key != [0; 16],
            JoinMode::Abp => {
                self.settings.dev_addr != [0; 4]
                    && self.settings.nwk_skey != [0; 16]
                    && self.settings.app_skey != [0; 16]
            }
        };
        if !provisioned {
            return MacStatus::JoinFailed;
        }
        self.joined = true;
        MacStatus::JoinSucceeded
    }

    fn send(&mut self, data: &[u8], confirmed: bool, port: u8) -> MacStatus {
        if !self.joined {
            return MacStatus::NotJoined;
        }
        if self.pending_uplink {
            return MacStatus::Busy;
        }
        if let Some(last) = self.last_uplink {
            if last.elapsed() < self.uplink_interval {
                return MacStatus::DutyCycleRestricted;
            }
        }
        debug!(len = data.len(), confirmed, port, "Simulated uplink");
        self.pending_uplink = true;
        self.last_uplink = Some(Instant::now());
        if confirmed {
            self.queue_downlink(Downlink {
                payload: data.to_vec(),
                port,
            });
        }
        MacStatus::TxOk
    }

    fn recv(&mut self) -> MacStatus {
        if !self.pending_uplink {
            return MacStatus::TxError;
        }
        self.pending_uplink = false;
        if self.link_check_requested {
            self.link_check_requested = false;
            self.link_check = LinkCheck {
                available: true,
                demod_margin: 20,
                gateways: 1,
            };
        } else {
            self.link_check.available = false;
        }
        match self.downlinks.pop_front() {
            Some(downlink) => MacStatus::DataReceived(downlink),
            None => MacStatus::TxDone,
        }
    }

    fn request_link_check(&mut self) {
        self.link_check_requested = true;
    }

    fn link_check(&self) -> LinkCheck {
        self.link_check
    }

    fn settings(&self) -> MacSettings {
        self.settings.clone()
    }

    fn set(&mut self, value: &MacValue) {
        self.settings.apply(value);
    }
}
