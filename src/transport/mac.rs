//! Long-range MAC variant (LoRaWAN style).
//!
//! The adapter drives an explicit state machine on top of the MAC stack:
//!
//! ```text
//! NotJoined -> Joining -> Joined -> Sending -> Joined
//! ```
//!
//! A send only starts from `Joined` and always waits for the receive windows
//! before returning.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Delivery, Outcome, Port, Reason, Transmit, TransmitOptions};
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Otaa,
    Abp,
}

impl JoinMode {
    pub fn parse(s: &str) -> AgentResult<Self> {
        match s {
            "otaa" => Ok(JoinMode::Otaa),
            "abp" => Ok(JoinMode::Abp),
            _ => Err(AgentError::invalid("Usage: loramac join <otaa|abp>")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    pub payload: Vec<u8>,
    pub port: u8,
}

/// Result codes reported by the MAC stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacStatus {
    JoinSucceeded,
    AlreadyJoined,
    JoinFailed,
    DutyCycleRestricted,
    Busy,
    NotJoined,
    TxOk,
    TxError,
    TxDone,
    DataReceived(Downlink),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCheck {
    pub available: bool,
    pub demod_margin: u8,
    pub gateways: u8,
}

/// Result of a completed send, after the receive windows closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxReport {
    pub downlink: Option<Downlink>,
    pub link_check: Option<LinkCheck>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
}

/// Device identity and radio parameters held by the MAC stack.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MacSettings {
    pub dev_eui: [u8; 8],
    pub app_eui: [u8; 8],
    pub app_key: [u8; 16],
    pub app_skey: [u8; 16],
    pub nwk_skey: [u8; 16],
    pub dev_addr: [u8; 4],
    pub class: DeviceClass,
    pub dr: u8,
    pub adr: bool,
    pub public_network: bool,
    pub net_id: u32,
    pub tx_power: u8,
    pub rx2_freq: u32,
    pub rx2_dr: u8,
}

impl Default for MacSettings {
    fn default() -> Self {
        Self {
            dev_eui: [0; 8],
            app_eui: [0; 8],
            app_key: [0; 16],
            app_skey: [0; 16],
            nwk_skey: [0; 16],
            dev_addr: [0; 4],
            class: DeviceClass::A,
            dr: 0,
            adr: false,
            public_network: true,
            net_id: 0,
            tx_power: 1,
            rx2_freq: 869_525_000,
            rx2_dr: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacParam {
    DevEui,
    AppEui,
    AppKey,
    AppSKey,
    NwkSKey,
    DevAddr,
    Class,
    Dr,
    Adr,
    Public,
    NetId,
    TxPower,
    Rx2Freq,
    Rx2Dr,
}

impl MacParam {
    pub const USAGE: &'static str =
        "deveui|appeui|appkey|appskey|nwkskey|devaddr|class|dr|adr|public|netid|tx_power|rx2_freq|rx2_dr";

    pub fn parse(s: &str) -> AgentResult<Self> {
        Ok(match s {
            "deveui" => MacParam::DevEui,
            "appeui" => MacParam::AppEui,
            "appkey" => MacParam::AppKey,
            "appskey" => MacParam::AppSKey,
            "nwkskey" => MacParam::NwkSKey,
            "devaddr" => MacParam::DevAddr,
            "class" => MacParam::Class,
            "dr" => MacParam::Dr,
            "adr" => MacParam::Adr,
            "public" => MacParam::Public,
            "netid" => MacParam::NetId,
            "tx_power" => MacParam::TxPower,
            "rx2_freq" => MacParam::Rx2Freq,
            "rx2_dr" => MacParam::Rx2Dr,
            _ => return Err(AgentError::invalid(format!("unknown parameter '{s}' ({})", Self::USAGE))),
        })
    }

    fn usage(&self) -> &'static str {
        match self {
            MacParam::DevEui => "Usage: loramac set deveui <16 hex chars>",
            MacParam::AppEui => "Usage: loramac set appeui <16 hex chars>",
            MacParam::AppKey => "Usage: loramac set appkey <32 hex chars>",
            MacParam::AppSKey => "Usage: loramac set appskey <32 hex chars>",
            MacParam::NwkSKey => "Usage: loramac set nwkskey <32 hex chars>",
            MacParam::DevAddr => "Usage: loramac set devaddr <8 hex chars>",
            MacParam::Class => "Usage: loramac set class <A,B,C>",
            MacParam::Dr => "Usage: loramac set dr <0..15>",
            MacParam::Adr => "Usage: loramac set adr <on|off>",
            MacParam::Public => "Usage: loramac set public <on|off>",
            MacParam::NetId => "Usage: loramac set netid <integer value>",
            MacParam::TxPower => "Usage: loramac set tx_power <0..15>",
            MacParam::Rx2Freq => "Usage: loramac set rx2_freq <frequency>",
            MacParam::Rx2Dr => "Usage: loramac set rx2_dr <0..15>",
        }
    }
}

/// A validated parameter assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacValue {
    DevEui([u8; 8]),
    AppEui([u8; 8]),
    AppKey([u8; 16]),
    AppSKey([u8; 16]),
    NwkSKey([u8; 16]),
    DevAddr([u8; 4]),
    Class(DeviceClass),
    Dr(u8),
    Adr(bool),
    Public(bool),
    NetId(u32),
    TxPower(u8),
    Rx2Freq(u32),
    Rx2Dr(u8),
}

const MAX_DR: u8 = 15;

impl MacValue {
    pub fn parse(param: MacParam, text: &str) -> AgentResult<Self> {
        let bad = || AgentError::invalid(param.usage());
        let value = match param {
            MacParam::DevEui => MacValue::DevEui(parse_hex(text).ok_or_else(bad)?),
            MacParam::AppEui => MacValue::AppEui(parse_hex(text).ok_or_else(bad)?),
            MacParam::AppKey => MacValue::AppKey(parse_hex(text).ok_or_else(bad)?),
            MacParam::AppSKey => MacValue::AppSKey(parse_hex(text).ok_or_else(bad)?),
            MacParam::NwkSKey => MacValue::NwkSKey(parse_hex(text).ok_or_else(bad)?),
            MacParam::DevAddr => MacValue::DevAddr(parse_hex(text).ok_or_else(bad)?),
            MacParam::Class => MacValue::Class(match text {
                "A" => DeviceClass::A,
                "B" => DeviceClass::B,
                "C" => DeviceClass::C,
                _ => return Err(bad()),
            }),
            MacParam::Dr => MacValue::Dr(parse_dr(text).ok_or_else(bad)?),
            MacParam::Adr => MacValue::Adr(parse_switch(text).ok_or_else(bad)?),
            MacParam::Public => MacValue::Public(parse_switch(text).ok_or_else(bad)?),
            MacParam::NetId => MacValue::NetId(text.parse().map_err(|_| bad())?),
            MacParam::TxPower => MacValue::TxPower(parse_dr(text).ok_or_else(bad)?),
            MacParam::Rx2Freq => MacValue::Rx2Freq(text.parse().map_err(|_| bad())?),
            MacParam::Rx2Dr => MacValue::Rx2Dr(parse_dr(text).ok_or_else(bad)?),
        };
        Ok(value)
    }
}

impl MacSettings {
    pub fn apply(&mut self, value: &MacValue) {
        match *value {
            MacValue::DevEui(v) => self.dev_eui = v,
            MacValue::AppEui(v) => self.app_eui = v,
            MacValue::AppKey(v) => self.app_key = v,
            MacValue::AppSKey(v) => self.app_skey = v,
            MacValue::NwkSKey(v) => self.nwk_skey = v,
            MacValue::DevAddr(v) => self.dev_addr = v,
            MacValue::Class(v) => self.class = v,
            MacValue::Dr(v) => self.dr = v,
            MacValue::Adr(v) => self.adr = v,
            MacValue::Public(v) => self.public_network = v,
            MacValue::NetId(v) => self.net_id = v,
            MacValue::TxPower(v) => self.tx_power = v,
            MacValue::Rx2Freq(v) => self.rx2_freq = v,
            MacValue::Rx2Dr(v) => self.rx2_dr = v,
        }
    }

    /// One line in the shell's `loramac get` format.
    pub fn describe(&self, param: MacParam) -> String {
        let on_off = |b: bool| if b { "on" } else { "off" };
        match param {
            MacParam::DevEui => format!("DEVEUI: {}", to_hex(&self.dev_eui)),
            MacParam::AppEui => format!("APPEUI: {}", to_hex(&self.app_eui)),
            MacParam::AppKey => format!("APPKEY: {}", to_hex(&self.app_key)),
            MacParam::AppSKey => format!("APPSKEY: {}", to_hex(&self.app_skey)),
            MacParam::NwkSKey => format!("NWKSKEY: {}", to_hex(&self.nwk_skey)),
            MacParam::DevAddr => format!("DEVADDR: {}", to_hex(&self.dev_addr)),
            MacParam::Class => format!("Device class: {:?}", self.class),
            MacParam::Dr => format!("DATARATE: {}", self.dr),
            MacParam::Adr => format!("ADR: {}", on_off(self.adr)),
            MacParam::Public => format!("Public network: {}", on_off(self.public_network)),
            MacParam::NetId => format!("NetID: {}", self.net_id),
            MacParam::TxPower => format!("TX power index: {}", self.tx_power),
            MacParam::Rx2Freq => format!("RX2 freq: {}", self.rx2_freq),
            MacParam::Rx2Dr => format!("RX2 dr: {}", self.rx2_dr),
        }
    }
}

fn parse_dr(text: &str) -> Option<u8> {
    text.parse::<u8>().ok().filter(|dr| *dr <= MAX_DR)
}

fn parse_switch(text: &str) -> Option<bool> {
    match text {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

fn parse_hex<const N: usize>(text: &str) -> Option<[u8; N]> {
    if text.len() != N * 2 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Operations consumed from the underlying MAC stack.
pub trait MacStack: Send {
    fn init(&mut self);
    fn join(&mut self, mode: JoinMode) -> MacStatus;
    fn send(&mut self, data: &[u8], confirmed: bool, port: u8) -> MacStatus;
    /// Blocks until the receive windows of the last send closed.
    fn recv(&mut self) -> MacStatus;
    fn request_link_check(&mut self);
    fn link_check(&self) -> LinkCheck;
    fn settings(&self) -> MacSettings;
    fn set(&mut self, value: &MacValue);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    NotJoined,
    Joining,
    Joined,
    Sending,
}

pub struct MacTransport {
    stack: Box<dyn MacStack>,
    state: MacState,
}

impl MacTransport {
    pub fn new(mut stack: Box<dyn MacStack>) -> Self {
        stack.init();
        Self {
            stack,
            state: MacState::NotJoined,
        }
    }

    pub fn join(&mut self, mode: JoinMode) -> Outcome {
        let previous = self.state;
        self.state = MacState::Joining;
        let status = self.stack.join(mode);
        debug!(?mode, ?status, "Join finished");
        match status {
            MacStatus::JoinSucceeded => {
                info!(?mode, "Join procedure succeeded");
                self.state = MacState::Joined;
                Outcome::Ok(())
            }
            MacStatus::AlreadyJoined => {
                warn!("Join requested while already joined");
                self.state = MacState::Joined;
                Outcome::Retry(Reason::AlreadyJoined)
            }
            MacStatus::DutyCycleRestricted => self.join_failed(previous, Outcome::Retry(Reason::DutyCycleRestricted)),
            MacStatus::Busy => self.join_failed(previous, Outcome::Retry(Reason::Busy)),
            _ => self.join_failed(previous, Outcome::Fatal(Reason::JoinFailed)),
        }
    }

    fn join_failed(&mut self, previous: MacState, outcome: Outcome) -> Outcome {
        self.state = if previous == MacState::Joined {
            MacState::Joined
        } else {
            MacState::NotJoined
        };
        outcome
    }

    /// Sends `data` and waits for the receive windows.
    pub fn send(&mut self, data: &[u8], confirmed: bool, port: Port) -> Outcome<TxReport> {
        if self.state != MacState::Joined {
            return Outcome::Fatal(Reason::NotJoined);
        }
        self.state = MacState::Sending;
        let outcome = self.send_and_receive(data, confirmed, port);
        if self.state == MacState::Sending {
            self.state = MacState::Joined;
        }
        outcome
    }

    fn send_and_receive(&mut self, data: &[u8], confirmed: bool, port: Port) -> Outcome<TxReport> {
        debug!(len = data.len(), confirmed, port = port.get(), "Sending uplink");
        match self.stack.send(data, confirmed, port.get()) {
            MacStatus::TxOk => {}
            status => return self.tx_failure(status),
        }
        let downlink = match self.stack.recv() {
            MacStatus::DataReceived(downlink) => Some(downlink),
            MacStatus::TxDone => None,
            status => return self.tx_failure(status),
        };
        let link = self.stack.link_check();
        Outcome::Ok(TxReport {
            downlink,
            link_check: link.available.then_some(link),
        })
    }

    fn tx_failure(&mut self, status: MacStatus) -> Outcome<TxReport> {
        warn!(?status, "Uplink failed");
        match status {
            MacStatus::NotJoined => {
                self.state = MacState::NotJoined;
                Outcome::Fatal(Reason::NotJoined)
            }
            MacStatus::DutyCycleRestricted => Outcome::Retry(Reason::DutyCycleRestricted),
            MacStatus::Busy => Outcome::Retry(Reason::Busy),
            _ => Outcome::Fatal(Reason::TxError),
        }
    }

    /// Schedules a link check; its answer arrives with the next send.
    pub fn request_link_check(&mut self) {
        self.stack.request_link_check();
    }

    pub fn settings(&self) -> MacSettings {
        self.stack.settings()
    }

    pub fn set(&mut self, value: &MacValue) {
        self.stack.set(value);
    }
}

impl Transmit for MacTransport {
    fn transmit(&mut self, payload: &[u8], options: &TransmitOptions) -> AgentResult<Outcome<Delivery>> {
        Ok(self
            .send(payload, options.confirmed, options.port)
            .map(Delivery::Sent))
    }
}
