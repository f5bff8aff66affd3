use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::subscriptions::SharedSubscriptions;
use crate::transport::Inbound;

/// Background context: drains publications from the broker stack into the
/// subscription table, one at a time and in arrival order.
///
/// Returns the number of publications delivered once the stack drops its
/// sender.
pub async fn run(mut inbound: UnboundedReceiver<Inbound>, subscriptions: SharedSubscriptions) -> usize {
    info!("Inbound engine started");
    let mut delivered = 0;
    while let Some(message) = inbound.recv().await {
        debug!(topic_id = message.topic_id, len = message.payload.len(), "Inbound publication");
        if subscriptions.dispatch_inbound(&message) {
            delivered += 1;
        }
    }
    info!(delivered, "Inbound engine stopped");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::{DeliveryHandler, Publication, SubscriptionTable};
    use crate::transport::sim::LoopbackBroker;
    use crate::transport::{BrokerTransport, Outcome, TopicName};
    use crate::types::QoS;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn loopback_publications_arrive_in_order() {
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sink = seen.clone();
        let handler: DeliveryHandler = Arc::new(move |p: &Publication<'_>| {
            sink.lock().unwrap().push(p.payload.to_vec());
        });
        let subscriptions = SharedSubscriptions::new(SubscriptionTable::new(handler));

        let (tx, rx) = mpsc::unbounded_channel();
        let mut broker = BrokerTransport::new(Box::new(LoopbackBroker::new("test", tx)));
        let engine = tokio::spawn(run(rx, subscriptions.clone()));

        assert_eq!(broker.connect("[::1]:1883".parse().unwrap(), true, None), Outcome::Ok(()));
        subscriptions
            .lock()
            .subscribe(&mut broker, "weather", QoS::AtMostOnce)
            .unwrap();
        let topic = TopicName::new("weather").unwrap();
        let other = TopicName::new("other").unwrap();
        for i in 0..5u8 {
            assert!(matches!(broker.publish(&topic, &[i], QoS::AtMostOnce), Outcome::Ok(_)));
            assert!(matches!(broker.publish(&other, &[i], QoS::AtMostOnce), Outcome::Ok(_)));
        }

        drop(broker);
        let delivered = engine.await.unwrap();
        assert_eq!(delivered, 5);
        assert_eq!(*seen.lock().unwrap(), (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unmatched_publications_are_dropped() {
        let handler: DeliveryHandler = Arc::new(|_: &Publication<'_>| {});
        let subscriptions = SharedSubscriptions::new(SubscriptionTable::new(handler));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Inbound {
            topic_id: 42,
            topic_name: None,
            payload: b"lost".to_vec(),
        })
        .unwrap();
        drop(tx);
        assert_eq!(run(rx, subscriptions).await, 0);
    }
}
