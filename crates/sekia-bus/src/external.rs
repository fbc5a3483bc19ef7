// SPDX-License-Identifier: MIT OR Apache-2.0
//! NATS-backed bus (§4.4's "external mode").
//!
//! NATS subject wildcards (`*` token, `>` trailing) are exactly the
//! grammar in §3, so wildcard subscriptions are handed to the server
//! as-is; this module's job is reconnect/backoff (handled transparently
//! by the `async-nats` client) and adapting its subscriber stream to our
//! [`crate::Subscription`] shape.

use crate::{Bus, BusError, Message, Subscription};
use async_trait::async_trait;
use sekia_protocol::subject::validate_pattern;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

const SUBSCRIBER_CAPACITY: usize = 1024;

/// NATS-backed [`Bus`] implementation.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the NATS server at `url`, optionally authenticating with
    /// `token`. Reconnection is handled transparently below this API by
    /// the underlying client (per §4.4).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the initial connection fails.
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self, BusError> {
        let client = match token {
            Some(t) => async_nats::ConnectOptions::new()
                .token(t.to_string())
                .connect(url)
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?,
            None => async_nats::connect(url)
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?,
        };
        Ok(Self { client })
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        validate_pattern(pattern).map_err(|e| BusError::InvalidPattern(e.to_string()))?;

        let mut nats_sub = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let pattern_owned = pattern.to_string();
        let handle = tokio::spawn(async move {
            while let Some(nats_msg) = nats_sub.next().await {
                let msg = Message {
                    subject: nats_msg.subject.to_string(),
                    payload: nats_msg.payload.to_vec(),
                };
                if tx.send(msg).await.is_err() {
                    debug!(pattern = %pattern_owned, "subscription dropped, stopping forwarder");
                    break;
                }
            }
        });

        Ok(Subscription {
            pattern: pattern.to_string(),
            rx,
            _cancel: Box::new(AbortOnDrop(handle)),
        })
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    async fn drain(&self, grace: Duration) -> Result<(), BusError> {
        match tokio::time::timeout(grace, self.client.drain()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BusError::Connection(e.to_string())),
            Err(_) => {
                warn!(grace_ms = grace.as_millis(), "bus drain exceeded grace period");
                Ok(())
            }
        }
    }
}

/// Aborts the forwarding task when the subscription is dropped, so an
/// unused NATS subscription doesn't outlive its `Subscription` handle.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
