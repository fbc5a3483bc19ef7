// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process broker selected by config instead of an external bus.
//!
//! Delivery uses [`sekia_protocol::subject::matches`] so wildcard
//! semantics are identical to the NATS-backed [`crate::external::NatsBus`]
//! by construction — there is exactly one implementation of the matching
//! grammar in the workspace.

use crate::{Bus, BusError, Message, Subscription};
use async_trait::async_trait;
use sekia_protocol::subject::{matches, validate_pattern};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Channel capacity for each subscriber's inbox. A slow subscriber loses
/// messages (`try_send` fails silently) rather than blocking publishers —
/// consistent with "best-effort" delivery in §4.4.
const SUBSCRIBER_CAPACITY: usize = 1024;

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<Message>,
}

/// In-process pub/sub broker with no external dependency.
#[derive(Default)]
pub struct EmbeddedBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EmbeddedBus {
    /// Create a new, empty embedded broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Dropping this removes the subscriber entry on the next publish pass.
struct UnsubscribeMarker;

#[async_trait]
impl Bus for EmbeddedBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut subs = self.subscribers.write().await;
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            if matches(&sub.pattern, subject) {
                let msg = Message {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                };
                // Best-effort: a full inbox drops the message rather than
                // blocking the publisher (§4.4, §5 backpressure).
                let _ = sub.tx.try_send(msg);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        validate_pattern(pattern).map_err(|e| BusError::InvalidPattern(e.to_string()))?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.write().await.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription {
            pattern: pattern.to_string(),
            rx,
            _cancel: Box::new(UnsubscribeMarker),
        })
    }

    async fn flush(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn drain(&self, _grace: Duration) -> Result<(), BusError> {
        self.subscribers.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_subject_delivers() {
        let bus = EmbeddedBus::new();
        let mut sub = bus.subscribe("sekia.events.gmail").await.unwrap();
        bus.publish("sekia.events.gmail", b"hi".to_vec()).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "sekia.events.gmail");
        assert_eq!(msg.payload, b"hi");
    }

    #[tokio::test]
    async fn single_token_wildcard_matches_one_level() {
        let bus = EmbeddedBus::new();
        let mut sub = bus.subscribe("sekia.events.github.*").await.unwrap();
        bus.publish("sekia.events.github.push", vec![]).await.unwrap();
        bus.publish("sekia.events.github.pr.opened", vec![]).await.unwrap();
        bus.publish("sekia.events.gitlab.push", vec![]).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.subject, "sekia.events.github.push");

        // Nothing else should arrive; confirm the channel has no more
        // buffered messages without blocking forever.
        let second = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(second.is_err(), "expected no further deliveries");
    }

    #[tokio::test]
    async fn trailing_wildcard_matches_multiple_levels() {
        let bus = EmbeddedBus::new();
        let mut sub = bus.subscribe("sekia.events.github.>").await.unwrap();
        bus.publish("sekia.events.github.pr.opened", vec![]).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "sekia.events.github.pr.opened");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EmbeddedBus::new();
        let mut a = bus.subscribe("sekia.events.gmail").await.unwrap();
        let mut b = bus.subscribe("sekia.events.gmail").await.unwrap();
        bus.publish("sekia.events.gmail", vec![1]).await.unwrap();
        assert_eq!(a.recv().await.unwrap().payload, vec![1]);
        assert_eq!(b.recv().await.unwrap().payload, vec![1]);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_receiving() {
        let bus = EmbeddedBus::new();
        let sub = bus.subscribe("sekia.events.gmail").await.unwrap();
        drop(sub);
        // Publishing after drop must not error even though nobody is listening.
        bus.publish("sekia.events.gmail", vec![1]).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let bus = EmbeddedBus::new();
        assert!(bus.subscribe("a.>.b").await.is_err());
    }
}
