// SPDX-License-Identifier: MIT OR Apache-2.0
//! Publish/subscribe bus abstraction (§4.4).
//!
//! [`Bus`] is implemented twice: [`embedded::EmbeddedBus`], an in-process
//! broker with no external dependency, and [`external::NatsBus`], backed
//! by a real NATS server (chosen because NATS subject wildcards — `*` and
//! `>` — are exactly the grammar §3 specifies). Both must honour wildcard
//! subjects identically (§9); `tests/conformance.rs`-style coverage in
//! `sekia-engine` exercises both through the same [`Bus`] trait object.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod embedded;
pub mod external;

use async_trait::async_trait;
use std::time::Duration;

/// A single bus message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Message {
    /// The subject it was published on (not necessarily equal to the
    /// subscription pattern — may contain wildcard matches).
    pub subject: String,
    /// Raw message bytes (JSON-encoded `Event` or `Command`).
    pub payload: Vec<u8>,
}

/// Errors from bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Could not establish or maintain a connection to the broker.
    #[error("bus connection error: {0}")]
    Connection(String),
    /// `publish` failed after the connection was otherwise healthy.
    #[error("publish failed: {0}")]
    Publish(String),
    /// `subscribe` was given a malformed pattern.
    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),
}

/// A live subscription. Polling [`Subscription::recv`] yields messages in
/// arrival order; dropping the subscription (or calling
/// [`Subscription::unsubscribe`]) cancels it.
pub struct Subscription {
    pattern: String,
    rx: tokio::sync::mpsc::Receiver<Message>,
    _cancel: Box<dyn std::any::Any + Send + Sync>,
}

impl Subscription {
    /// The pattern this subscription was registered with.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Await the next message, or `None` once the subscription is
    /// cancelled and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Cancel the subscription. Equivalent to dropping it.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

/// Publish/subscribe bus abstraction (§4.4).
///
/// Implementations guarantee at-most-once local delivery to their own
/// handlers within a single process; cross-process durability is whatever
/// the underlying broker provides.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `payload` on `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to `pattern` (`*`/`>` wildcards per §3). Returns a
    /// cancellable [`Subscription`]; invocations for a single subscription
    /// are delivered in arrival order.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;

    /// Flush any buffered outbound messages.
    async fn flush(&self) -> Result<(), BusError>;

    /// Stop accepting new work and wait (bounded by `grace`) for
    /// in-flight deliveries to settle.
    async fn drain(&self, grace: Duration) -> Result<(), BusError>;
}
