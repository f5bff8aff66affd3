//! Fixed-capacity subscription table.
//!
//! Slots are allocated first-fit; a slot is occupied exactly when its topic id
//! is non-zero. The table is mutated from the shell and read from the
//! background engine, so it is shared through [`SharedSubscriptions`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::transport::{BrokerTransport, Inbound, Reason, TopicName};
use crate::types::QoS;

pub const SUBSCRIPTION_CAPACITY: usize = 16;

/// A publication as handed to a delivery handler.
#[derive(Debug, Clone, Copy)]
pub struct Publication<'a> {
    pub topic_name: &'a str,
    pub topic_id: u16,
    pub payload: &'a [u8],
}

pub type DeliveryHandler = Arc<dyn Fn(&Publication<'_>) + Send + Sync>;

#[derive(Default, Clone)]
pub struct Slot {
    topic_name: TopicName,
    topic_id: u16,
    qos: QoS,
    callback: Option<DeliveryHandler>,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.topic_id == 0
    }

    pub fn topic_name(&self) -> &str {
        self.topic_name.as_str()
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("topic_name", &self.topic_name.as_str())
            .field("topic_id", &self.topic_id)
            .field("qos", &self.qos)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Where a new subscription was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub index: usize,
    pub topic_id: u16,
}

pub struct SubscriptionTable<const N: usize = SUBSCRIPTION_CAPACITY> {
    slots: [Slot; N],
    handler: DeliveryHandler,
    strict: bool,
}

impl<const N: usize> SubscriptionTable<N> {
    /// Every subscription delivers through `handler`.
    pub fn new(handler: DeliveryHandler) -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::default()),
            handler,
            strict: false,
        }
    }

    /// In strict mode a second subscription to the same topic is rejected.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots.iter().enumerate().filter(|(_, s)| !s.is_empty())
    }

    pub fn find(&self, topic: &str) -> Option<(usize, &Slot)> {
        self.iter().find(|(_, s)| s.topic_name() == topic)
    }

    /// Subscribes through `broker` and stores the result in the first free
    /// slot. Nothing is stored unless the broker accepted the subscription.
    pub fn subscribe(
        &mut self,
        broker: &mut BrokerTransport,
        topic: &str,
        qos: QoS,
    ) -> AgentResult<SlotRef> {
        let name = TopicName::new(topic)?;
        if self.strict && self.find(topic).is_some() {
            return Err(AgentError::DuplicateTopic(topic.to_string()));
        }
        let index = self
            .slots
            .iter()
            .position(Slot::is_empty)
            .ok_or(AgentError::TableFull { capacity: N })?;

        let topic_id = broker.subscribe(&name, qos).into_result()?;
        if topic_id == 0 {
            warn!(topic, "Broker returned the reserved topic id 0");
            return Err(AgentError::Fatal(Reason::SubscribeFailed));
        }

        self.slots[index] = Slot {
            topic_name: name,
            topic_id,
            qos,
            callback: Some(self.handler.clone()),
        };
        info!(topic, topic_id, slot = index, qos = qos.level(), "Subscribed");
        Ok(SlotRef { index, topic_id })
    }

    /// Unsubscribes the slot holding `topic`. The slot is cleared only when
    /// the broker confirms, so a failed attempt can be repeated.
    pub fn unsubscribe(&mut self, broker: &mut BrokerTransport, topic: &str) -> AgentResult<()> {
        let (index, topic_id) = self
            .find(topic)
            .map(|(i, s)| (i, s.topic_id))
            .ok_or_else(|| AgentError::SubscriptionNotFound(topic.to_string()))?;

        broker.unsubscribe(topic_id).into_result()?;
        self.slots[index] = Slot::default();
        info!(topic, topic_id, slot = index, "Unsubscribed");
        Ok(())
    }

    /// Empties every slot without contacting the broker. Used when a clean
    /// session discarded the subscriptions on the gateway side. Returns the
    /// number of slots that were occupied.
    pub fn clear(&mut self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let dropped = self.len();
        self.slots = std::array::from_fn(|_| Slot::default());
        info!(dropped, "Subscription table cleared");
        dropped
    }

    /// Resolves the handler for an inbound publication, by id first and by
    /// name when the id is unknown.
    fn route(&self, inbound: &Inbound) -> Option<(DeliveryHandler, TopicName)> {
        let by_id = self
            .iter()
            .find(|(_, s)| s.topic_id == inbound.topic_id)
            .map(|(_, s)| s);
        let slot = by_id.or_else(|| {
            let name = inbound.topic_name.as_deref()?;
            self.find(name).map(|(_, s)| s)
        })?;
        let callback = slot.callback.clone()?;
        Some((callback, slot.topic_name.clone()))
    }
}

fn deliver(route: Option<(DeliveryHandler, TopicName)>, inbound: &Inbound) -> bool {
    match route {
        Some((callback, name)) => {
            debug!(topic = %name, topic_id = inbound.topic_id, len = inbound.payload.len(), "Delivering publication");
            callback(&Publication {
                topic_name: name.as_str(),
                topic_id: inbound.topic_id,
                payload: &inbound.payload,
            });
            true
        }
        None => {
            warn!(
                topic_id = inbound.topic_id,
                topic = ?inbound.topic_name,
                "Dropping publication for unknown subscription"
            );
            false
        }
    }
}

/// Handle shared between the shell and the background engine.
#[derive(Clone)]
pub struct SharedSubscriptions(Arc<Mutex<SubscriptionTable>>);

impl SharedSubscriptions {
    pub fn new(table: SubscriptionTable) -> Self {
        Self(Arc::new(Mutex::new(table)))
    }

    pub fn lock(&self) -> MutexGuard<'_, SubscriptionTable> {
        // A panicking handler must not wedge the table.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands `inbound` to its subscription's handler, after the lock is
    /// released. Unmatched publications are logged and dropped.
    pub fn dispatch_inbound(&self, inbound: &Inbound) -> bool {
        let route = self.lock().route(inbound);
        deliver(route, inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::transport::broker::tests::FakeBroker;
    use crate::transport::broker::BrokerCode;

    type Seen = Arc<Mutex<Vec<(String, u16, Vec<u8>)>>>;

    fn recorder() -> (DeliveryHandler, Seen) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let handler: DeliveryHandler = Arc::new(move |p: &Publication<'_>| {
            sink.lock()
                .unwrap()
                .push((p.topic_name.to_string(), p.topic_id, p.payload.to_vec()));
        });
        (handler, seen)
    }

    fn broker(fake: &FakeBroker) -> BrokerTransport {
        BrokerTransport::new(Box::new(fake.clone()))
    }

    #[test]
    fn overflow_fails_with_resource_exhausted() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler);

        for i in 0..4 {
            let slot = table.subscribe(&mut broker, &format!("t{i}"), QoS::AtMostOnce).unwrap();
            assert_eq!(slot.index, i);
        }
        let err = table.subscribe(&mut broker, "t4", QoS::AtMostOnce).unwrap_err();
        assert_eq!(err, AgentError::TableFull { capacity: 4 });
        assert_eq!(err.class(), ErrorClass::ResourceExhausted);
        assert_eq!(table.len(), 4);
        assert!((0..4).all(|i| table.find(&format!("t{i}")).is_some()));
        // The full table never reached the broker.
        assert_eq!(fake.calls().len(), 4);
    }

    #[test]
    fn default_capacity_is_sixteen() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table: SubscriptionTable = SubscriptionTable::new(handler);
        assert!(table.is_empty());
        for i in 0..SUBSCRIPTION_CAPACITY {
            table.subscribe(&mut broker, &format!("t{i}"), QoS::AtMostOnce).unwrap();
        }
        assert_eq!(
            table.subscribe(&mut broker, "extra", QoS::AtMostOnce).unwrap_err(),
            AgentError::TableFull { capacity: 16 }
        );
    }

    #[test]
    fn clear_frees_every_slot_without_broker_calls() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler);
        assert_eq!(table.clear(), 0);
        table.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();
        table.subscribe(&mut broker, "b", QoS::AtMostOnce).unwrap();

        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
        assert_eq!(fake.calls(), vec!["subscribe a", "subscribe b"]);
        assert_eq!(table.subscribe(&mut broker, "b", QoS::AtMostOnce).unwrap().index, 0);
    }

    #[test]
    fn unknown_topic_unsubscribe_leaves_table_alone() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler);
        table.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();

        let err = table.unsubscribe(&mut broker, "b").unwrap_err();
        assert_eq!(err, AgentError::SubscriptionNotFound("b".into()));
        assert_eq!(table.len(), 1);
        assert_eq!(fake.calls(), vec!["subscribe a"]);
    }

    #[test]
    fn unsubscribe_then_resubscribe_reuses_slot() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler);
        table.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();
        table.subscribe(&mut broker, "b", QoS::AtLeastOnce).unwrap();

        table.unsubscribe(&mut broker, "a").unwrap();
        assert!(table.find("a").is_none());
        let again = table.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();
        assert_eq!(again.index, 0);
    }

    #[test]
    fn failed_unsubscribe_keeps_slot() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler);
        table.subscribe(&mut broker, "a", QoS::ExactlyOnce).unwrap();

        *fake.fail_unsubscribe.lock().unwrap() = Some(BrokerCode::Error);
        let err = table.unsubscribe(&mut broker, "a").unwrap_err();
        assert_eq!(err, AgentError::Fatal(Reason::UnsubscribeFailed));
        let (_, slot) = table.find("a").unwrap();
        assert_eq!(slot.qos, QoS::ExactlyOnce);

        *fake.fail_unsubscribe.lock().unwrap() = None;
        table.unsubscribe(&mut broker, "a").unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn rejected_subscribe_commits_nothing() {
        let fake = FakeBroker {
            fail_subscribe: Some(BrokerCode::NoGateway),
            ..FakeBroker::default()
        };
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler);
        let err = table.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap_err();
        assert_eq!(err, AgentError::Fatal(Reason::NoGateway));
        assert!(table.is_empty());
    }

    #[test]
    fn long_topic_rejected_before_broker() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler);
        let err = table
            .subscribe(&mut broker, &"x".repeat(65), QoS::AtMostOnce)
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn duplicates_allowed_unless_strict() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, _) = recorder();
        let mut table = SubscriptionTable::<4>::new(handler.clone());
        table.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();
        table.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();
        assert_eq!(table.len(), 2);

        let mut strict = SubscriptionTable::<4>::new(handler).strict(true);
        strict.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();
        assert_eq!(
            strict.subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap_err(),
            AgentError::DuplicateTopic("a".into())
        );
    }

    #[test]
    fn inbound_routed_by_id_then_name() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let (handler, seen) = recorder();
        let table = SharedSubscriptions::new(SubscriptionTable::new(handler));
        let a = table.lock().subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();

        assert!(table.dispatch_inbound(&Inbound {
            topic_id: a.topic_id,
            topic_name: None,
            payload: b"1".to_vec(),
        }));
        assert!(table.dispatch_inbound(&Inbound {
            topic_id: 999,
            topic_name: Some("a".into()),
            payload: b"2".to_vec(),
        }));
        assert!(!table.dispatch_inbound(&Inbound {
            topic_id: 999,
            topic_name: None,
            payload: b"3".to_vec(),
        }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("a".to_string(), a.topic_id, b"1".to_vec()));
        assert_eq!(seen[1].2, b"2".to_vec());
    }

    #[test]
    fn shared_handle_delivers_outside_lock() {
        let fake = FakeBroker::default();
        let mut broker = broker(&fake);
        let shared_slot: Arc<Mutex<Option<SharedSubscriptions>>> = Arc::default();
        let probe = shared_slot.clone();
        let handler: DeliveryHandler = Arc::new(move |_: &Publication<'_>| {
            // Re-entering the table from a handler must not deadlock.
            if let Some(shared) = probe.lock().unwrap().as_ref() {
                assert_eq!(shared.lock().len(), 1);
            }
        });
        let shared = SharedSubscriptions::new(SubscriptionTable::new(handler));
        *shared_slot.lock().unwrap() = Some(shared.clone());

        let slot = shared.lock().subscribe(&mut broker, "a", QoS::AtMostOnce).unwrap();
        assert!(shared.dispatch_inbound(&Inbound {
            topic_id: slot.topic_id,
            topic_name: None,
            payload: Vec::new(),
        }));
    }
}
