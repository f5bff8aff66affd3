//! Publish/subscribe broker variant (MQTT-SN style gateway).

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use super::{Delivery, Outcome, Reason, TopicName, Transmit, TransmitOptions};
use crate::error::{AgentError, AgentResult};
use crate::types::QoS;

/// Result codes reported by the broker stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerCode {
    Ok,
    NoGateway,
    Error,
}

/// A publication received from the gateway, handed to the background engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic_id: u16,
    pub topic_name: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
}

/// Operations consumed from the underlying broker protocol stack.
///
/// Inbound publications are not returned here; the stack forwards them to
/// the channel it was built with.
pub trait BrokerStack: Send {
    fn connect(&mut self, gateway: SocketAddr, clean: bool, will: Option<&Will>) -> BrokerCode;
    fn disconnect(&mut self) -> BrokerCode;
    fn register_topic(&mut self, name: &str) -> Result<u16, BrokerCode>;
    fn publish(&mut self, topic_id: u16, data: &[u8], qos: QoS) -> BrokerCode;
    fn subscribe(&mut self, name: &str, qos: QoS) -> Result<u16, BrokerCode>;
    fn unsubscribe(&mut self, topic_id: u16) -> BrokerCode;
    fn update_will_topic(&mut self, topic: &str, qos: QoS) -> BrokerCode;
    fn update_will_message(&mut self, message: &[u8]) -> BrokerCode;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connected,
}

pub struct BrokerTransport {
    stack: Box<dyn BrokerStack>,
    state: BrokerState,
    gateway: Option<SocketAddr>,
}

impl BrokerTransport {
    pub fn new(stack: Box<dyn BrokerStack>) -> Self {
        Self {
            stack,
            state: BrokerState::Disconnected,
            gateway: None,
        }
    }

    pub fn gateway(&self) -> Option<SocketAddr> {
        self.gateway
    }

    pub fn connect(&mut self, gateway: SocketAddr, clean: bool, will: Option<&Will>) -> Outcome {
        if self.state == BrokerState::Connected {
            return Outcome::Fatal(Reason::AlreadyConnected);
        }
        match self.stack.connect(gateway, clean, will) {
            BrokerCode::Ok => {
                info!(%gateway, clean, "Connected to gateway");
                self.state = BrokerState::Connected;
                self.gateway = Some(gateway);
                Outcome::Ok(())
            }
            BrokerCode::NoGateway => Outcome::Fatal(Reason::NoGateway),
            BrokerCode::Error => Outcome::Fatal(Reason::Failure),
        }
    }

    pub fn disconnect(&mut self) -> Outcome {
        if self.state == BrokerState::Disconnected {
            return Outcome::Fatal(Reason::NotConnected);
        }
        let code = self.stack.disconnect();
        match code {
            BrokerCode::Ok | BrokerCode::NoGateway => {
                // Either way there is no session left.
                self.state = BrokerState::Disconnected;
                self.gateway = None;
                if code == BrokerCode::Ok {
                    info!("Disconnected from gateway");
                    Outcome::Ok(())
                } else {
                    Outcome::Fatal(Reason::NotConnected)
                }
            }
            BrokerCode::Error => Outcome::Fatal(Reason::Failure),
        }
    }

    /// Registers `topic` and publishes `data` to the returned id.
    pub fn publish(&mut self, topic: &TopicName, data: &[u8], qos: QoS) -> Outcome<u16> {
        let topic_id = match self.stack.register_topic(topic.as_str()) {
            Ok(id) => id,
            Err(code) => {
                warn!(topic = %topic, ?code, "Topic registration failed");
                return Outcome::Fatal(register_reason(code));
            }
        };
        debug!(topic = %topic, topic_id, qos = qos.level(), len = data.len(), "Publishing");
        match self.stack.publish(topic_id, data, qos) {
            BrokerCode::Ok => Outcome::Ok(topic_id),
            BrokerCode::NoGateway => Outcome::Fatal(Reason::NoGateway),
            BrokerCode::Error => Outcome::Fatal(Reason::PublishFailed),
        }
    }

    pub fn subscribe(&mut self, topic: &TopicName, qos: QoS) -> Outcome<u16> {
        match self.stack.subscribe(topic.as_str(), qos) {
            Ok(id) => Outcome::Ok(id),
            Err(BrokerCode::NoGateway) => Outcome::Fatal(Reason::NoGateway),
            Err(_) => Outcome::Fatal(Reason::SubscribeFailed),
        }
    }

    pub fn unsubscribe(&mut self, topic_id: u16) -> Outcome {
        match self.stack.unsubscribe(topic_id) {
            BrokerCode::Ok => Outcome::Ok(()),
            BrokerCode::NoGateway => Outcome::Fatal(Reason::NoGateway),
            BrokerCode::Error => Outcome::Fatal(Reason::UnsubscribeFailed),
        }
    }

    /// Replaces the last-will topic, then the message.
    pub fn update_will(&mut self, will: &Will) -> Outcome {
        let code = self.stack.update_will_topic(&will.topic, QoS::AtMostOnce);
        if code != BrokerCode::Ok {
            return will_failure(code);
        }
        match self.stack.update_will_message(&will.message) {
            BrokerCode::Ok => Outcome::Ok(()),
            code => will_failure(code),
        }
    }
}

fn will_failure(code: BrokerCode) -> Outcome {
    match code {
        BrokerCode::NoGateway => Outcome::Fatal(Reason::NoGateway),
        _ => Outcome::Fatal(Reason::WillUpdateFailed),
    }
}

fn register_reason(code: BrokerCode) -> Reason {
    match code {
        BrokerCode::NoGateway => Reason::NoGateway,
        _ => Reason::RegisterFailed,
    }
}

impl Transmit for BrokerTransport {
    fn transmit(&mut self, payload: &[u8], options: &TransmitOptions) -> AgentResult<Outcome<Delivery>> {
        let topic = options
            .topic
            .clone()
            .ok_or_else(|| AgentError::invalid("a topic is required to publish"))?;
        let bytes = payload.len();
        Ok(self
            .publish(&topic, payload, options.qos)
            .map(|topic_id| Delivery::Published {
                topic,
                topic_id,
                bytes,
            }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Scripted stack that records every call it receives.
    #[derive(Clone, Default)]
    pub(crate) struct FakeBroker {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub connect_code: Option<BrokerCode>,
        pub fail_register: Option<BrokerCode>,
        pub fail_publish: Option<BrokerCode>,
        pub fail_subscribe: Option<BrokerCode>,
        pub fail_unsubscribe: Arc<Mutex<Option<BrokerCode>>>,
        pub disconnect_code: Option<BrokerCode>,
    }

    impl FakeBroker {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl BrokerStack for FakeBroker {
        fn connect(&mut self, gateway: SocketAddr, clean: bool, _will: Option<&Will>) -> BrokerCode {
            self.record(format!("connect {gateway} {clean}"));
            self.connect_code.unwrap_or(BrokerCode::Ok)
        }

        fn disconnect(&mut self) -> BrokerCode {
            self.record("disconnect".into());
            self.disconnect_code.unwrap_or(BrokerCode::Ok)
        }

        fn register_topic(&mut self, name: &str) -> Result<u16, BrokerCode> {
            self.record(format!("register {name}"));
            match self.fail_register {
                Some(code) => Err(code),
                None => Ok(7),
            }
        }

        fn publish(&mut self, topic_id: u16, data: &[u8], qos: QoS) -> BrokerCode {
            self.record(format!("publish {topic_id} {} {}", data.len(), qos.level()));
            self.fail_publish.unwrap_or(BrokerCode::Ok)
        }

        fn subscribe(&mut self, name: &str, _qos: QoS) -> Result<u16, BrokerCode> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(format!("subscribe {name}"));
            match self.fail_subscribe {
                Some(code) => Err(code),
                None => Ok(calls.len() as u16),
            }
        }

        fn unsubscribe(&mut self, topic_id: u16) -> BrokerCode {
            self.record(format!("unsubscribe {topic_id}"));
            self.fail_unsubscribe.lock().unwrap().unwrap_or(BrokerCode::Ok)
        }

        fn update_will_topic(&mut self, topic: &str, _qos: QoS) -> BrokerCode {
            self.record(format!("will_topic {topic}"));
            BrokerCode::Ok
        }

        fn update_will_message(&mut self, message: &[u8]) -> BrokerCode {
            self.record(format!("will_message {}", message.len()));
            BrokerCode::Error
        }
    }

    fn gateway() -> SocketAddr {
        "[::1]:1883".parse().unwrap()
    }

    #[test]
    fn second_connect_is_fatal() {
        let fake = FakeBroker::default();
        let mut broker = BrokerTransport::new(Box::new(fake.clone()));
        assert_eq!(broker.connect(gateway(), true, None), Outcome::Ok(()));
        assert_eq!(
            broker.connect(gateway(), true, None),
            Outcome::Fatal(Reason::AlreadyConnected)
        );
        assert_eq!(fake.calls().len(), 1);
        assert_eq!(broker.gateway(), Some(gateway()));
    }

    #[test]
    fn connect_failures_are_fatal() {
        for (code, reason) in [
            (BrokerCode::NoGateway, Reason::NoGateway),
            (BrokerCode::Error, Reason::Failure),
        ] {
            let fake = FakeBroker {
                connect_code: Some(code),
                ..FakeBroker::default()
            };
            let mut broker = BrokerTransport::new(Box::new(fake.clone()));
            assert_eq!(broker.connect(gateway(), true, None), Outcome::Fatal(reason));
            assert_eq!(broker.state, BrokerState::Disconnected);
            assert_eq!(broker.gateway(), None);
            assert_eq!(broker.disconnect(), Outcome::Fatal(Reason::NotConnected));
            assert_eq!(fake.calls().len(), 1);
        }
    }

    #[test]
    fn disconnect_without_session() {
        let fake = FakeBroker::default();
        let mut broker = BrokerTransport::new(Box::new(fake.clone()));
        assert_eq!(broker.disconnect(), Outcome::Fatal(Reason::NotConnected));
        assert!(fake.calls().is_empty());

        let _ = broker.connect(gateway(), true, None);
        assert_eq!(broker.disconnect(), Outcome::Ok(()));
        assert_eq!(broker.state, BrokerState::Disconnected);
        assert_eq!(broker.gateway(), None);
    }

    #[test]
    fn publish_failing_registration_skips_publish() {
        let fake = FakeBroker {
            fail_register: Some(BrokerCode::Error),
            ..FakeBroker::default()
        };
        let mut broker = BrokerTransport::new(Box::new(fake.clone()));
        let topic = TopicName::new("weather").unwrap();
        assert_eq!(
            broker.publish(&topic, b"x", QoS::AtMostOnce),
            Outcome::Fatal(Reason::RegisterFailed)
        );
        assert_eq!(fake.calls(), vec!["register weather".to_string()]);
    }

    #[test]
    fn publish_is_two_phase() {
        let fake = FakeBroker::default();
        let mut broker = BrokerTransport::new(Box::new(fake.clone()));
        let topic = TopicName::new("weather").unwrap();
        assert_eq!(broker.publish(&topic, b"abc", QoS::AtLeastOnce), Outcome::Ok(7));
        assert_eq!(fake.calls(), vec!["register weather", "publish 7 3 1"]);
    }

    #[test]
    fn publish_rejected_by_gateway_is_fatal() {
        let fake = FakeBroker {
            fail_publish: Some(BrokerCode::NoGateway),
            ..FakeBroker::default()
        };
        let mut broker = BrokerTransport::new(Box::new(fake));
        let topic = TopicName::new("weather").unwrap();
        assert_eq!(
            broker.publish(&topic, b"abc", QoS::AtMostOnce),
            Outcome::Fatal(Reason::NoGateway)
        );
    }

    #[test]
    fn transmit_requires_topic() {
        let fake = FakeBroker::default();
        let mut broker = BrokerTransport::new(Box::new(fake.clone()));
        let err = broker.transmit(b"x", &TransmitOptions::default()).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn will_update_stops_at_first_failure() {
        let fake = FakeBroker::default();
        let mut broker = BrokerTransport::new(Box::new(fake.clone()));
        let will = Will {
            topic: "last".into(),
            message: b"bye".to_vec(),
        };
        assert_eq!(
            broker.update_will(&will),
            Outcome::Fatal(Reason::WillUpdateFailed)
        );
        assert_eq!(fake.calls(), vec!["will_topic last", "will_message 3"]);
    }
}
