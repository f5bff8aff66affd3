//! Transport abstraction.
//!
//! Both network variants report through one vocabulary: an operation either
//! succeeds, fails in a way worth re-issuing later ([`Outcome::Retry`]) or
//! fails outright ([`Outcome::Fatal`]). The variant is chosen once at startup
//! and held in [`Transport`].

use serde::{Deserialize, Serialize};
use std::fmt;

use thiserror::Error;

use crate::error::{AgentError, AgentResult};
use crate::types::QoS;

pub mod broker;
pub mod mac;
pub mod sim;

pub use broker::{BrokerTransport, Inbound, Will};
pub use mac::{JoinMode, MacTransport, TxReport};

/// Why a transport operation did not succeed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    #[error("already connected to a gateway")]
    AlreadyConnected,
    #[error("not connected to any broker")]
    NotConnected,
    #[error("no gateway reachable")]
    NoGateway,
    #[error("unable to obtain topic ID")]
    RegisterFailed,
    #[error("unable to publish data")]
    PublishFailed,
    #[error("unable to subscribe")]
    SubscribeFailed,
    #[error("unable to unsubscribe")]
    UnsubscribeFailed,
    #[error("unable to update the last will")]
    WillUpdateFailed,
    #[error("broker stack failure")]
    Failure,
    #[error("dutycycle restriction")]
    DutyCycleRestricted,
    #[error("mac is busy")]
    Busy,
    #[error("join procedure failed")]
    JoinFailed,
    #[error("already joined")]
    AlreadyJoined,
    #[error("not joined")]
    NotJoined,
    #[error("transmission error")]
    TxError,
}

/// Normalized result of a transport operation.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Outcome<T = ()> {
    Ok(T),
    Retry(Reason),
    Fatal(Reason),
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Retry(r) => Outcome::Retry(r),
            Outcome::Fatal(r) => Outcome::Fatal(r),
        }
    }

    pub fn into_result(self) -> AgentResult<T> {
        match self {
            Outcome::Ok(v) => Ok(v),
            Outcome::Retry(r) => Err(AgentError::Retry(r)),
            Outcome::Fatal(r) => Err(AgentError::Fatal(r)),
        }
    }
}

pub const MAX_TOPIC_LEN: usize = 64;

/// A broker topic name of at most [`MAX_TOPIC_LEN`] bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicName(heapless::String<MAX_TOPIC_LEN>);

impl TopicName {
    pub fn new(name: &str) -> AgentResult<Self> {
        if name.is_empty() {
            return Err(AgentError::invalid("topic name must not be empty"));
        }
        heapless::String::try_from(name)
            .map(TopicName)
            .map_err(|_| AgentError::TopicTooLong {
                len: name.len(),
                max: MAX_TOPIC_LEN,
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LoRaWAN application port, 1..=223.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port(u8);

impl Port {
    pub const DEFAULT: Port = Port(2);

    pub fn new(port: u16) -> AgentResult<Self> {
        match port {
            1..=223 => Ok(Port(port as u8)),
            _ => Err(AgentError::InvalidPort(port)),
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Port {
    fn default() -> Self {
        Port::DEFAULT
    }
}

/// Per-send routing, each variant reads the fields it understands.
#[derive(Debug, Clone, Default)]
pub struct TransmitOptions {
    pub topic: Option<TopicName>,
    pub qos: QoS,
    pub confirmed: bool,
    pub port: Port,
}

impl TransmitOptions {
    pub fn topic(topic: TopicName, qos: QoS) -> Self {
        Self {
            topic: Some(topic),
            qos,
            ..Self::default()
        }
    }

    pub fn lora(confirmed: bool, port: Port) -> Self {
        Self {
            confirmed,
            port,
            ..Self::default()
        }
    }
}

/// What a successful transmit produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Published { topic: TopicName, topic_id: u16, bytes: usize },
    Sent(TxReport),
}

/// Sending a payload over whichever link is active.
pub trait Transmit {
    fn transmit(&mut self, payload: &[u8], options: &TransmitOptions) -> AgentResult<Outcome<Delivery>>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Broker,
    Mac,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Broker => "broker",
            TransportKind::Mac => "mac",
        }
    }
}

/// The single transport configured for this process.
pub enum Transport {
    Broker(BrokerTransport),
    Mac(MacTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Broker(_) => TransportKind::Broker,
            Transport::Mac(_) => TransportKind::Mac,
        }
    }

    pub fn broker(&mut self, command: &'static str) -> AgentResult<&mut BrokerTransport> {
        match self {
            Transport::Broker(b) => Ok(b),
            Transport::Mac(_) => Err(AgentError::Unsupported(command, "mac")),
        }
    }

    pub fn mac(&mut self, command: &'static str) -> AgentResult<&mut MacTransport> {
        match self {
            Transport::Mac(m) => Ok(m),
            Transport::Broker(_) => Err(AgentError::Unsupported(command, "broker")),
        }
    }
}

impl Transmit for Transport {
    fn transmit(&mut self, payload: &[u8], options: &TransmitOptions) -> AgentResult<Outcome<Delivery>> {
        match self {
            Transport::Broker(b) => b.transmit(payload, options),
            Transport::Mac(m) => m.transmit(payload, options),
        }
    }
}
