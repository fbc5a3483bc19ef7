// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event/command dispatcher (§4.8): classify a raw bus message, gate
//! commands on signature/freshness, and hand the rest to a workflow's
//! bounded queue.

use crate::queue::{BoundedQueue, PushOutcome};
use chrono::Duration as ChronoDuration;
use sekia_bus::Subscription;
use sekia_protocol::{Command, Event};
use sekia_security::NonceCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// One unit of work for a workflow's single-consumer queue: the subject it
/// arrived on, and the JSON value passed to the matching callback(s).
pub struct DispatchJob {
    /// The subject the message was published on.
    pub subject: String,
    /// The script-side value (an `Event` or verified `Command`, as JSON).
    pub payload: serde_json::Value,
}

/// Why a raw bus message could not be classified or parsed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The payload was not valid JSON, or didn't match either shape.
    #[error("malformed message: {0}")]
    Parse(#[from] serde_json::Error),
    /// The payload parsed as JSON but matched neither an `Event` nor a
    /// `Command` shape.
    #[error("message matches neither the Event nor the Command shape")]
    UnknownShape,
}

/// A parsed, shape-classified bus message.
pub enum Classified {
    /// Looked like an `Event` (has a `type` field).
    Event(Event),
    /// Looked like a `Command` (has `nonce` and `signature` fields).
    Command(Command),
}

/// Classify raw message bytes per §4.8 step 1: parse JSON, then decide
/// whether it's an `Event` or a `Command` by shape.
///
/// # Errors
///
/// [`DispatchError::Parse`] on invalid JSON or a shape mismatch once a
/// kind is chosen; [`DispatchError::UnknownShape`] if neither shape fits.
pub fn classify(bytes: &[u8]) -> Result<Classified, DispatchError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.get("nonce").is_some() && value.get("signature").is_some() {
        Ok(Classified::Command(serde_json::from_value(value)?))
    } else if value.get("type").is_some() {
        Ok(Classified::Event(serde_json::from_value(value)?))
    } else {
        Err(DispatchError::UnknownShape)
    }
}

/// Spawn the task that drains `subscription`, classifies each message,
/// verifies command ingress (§4.8 step 4), and pushes onto `queue`.
#[allow(clippy::too_many_arguments)]
pub fn spawn_subject_forwarder(
    mut subscription: Subscription,
    queue: Arc<BoundedQueue<DispatchJob>>,
    command_secret: Arc<Vec<u8>>,
    freshness_window: ChronoDuration,
    nonce_cache: Arc<NonceCache>,
    errors: Arc<AtomicU64>,
    overflow: Arc<AtomicU64>,
    workflow_name: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = subscription.recv().await {
            let parsed = match classify(&msg.payload) {
                Ok(p) => p,
                Err(e) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        workflow = %workflow_name,
                        subject = %msg.subject,
                        error = %e,
                        "dropping malformed message"
                    );
                    continue;
                }
            };

            let payload = match parsed {
                Classified::Event(event) => serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
                Classified::Command(cmd) => {
                    let verdict = sekia_security::signing::verify(
                        &cmd,
                        &command_secret,
                        chrono::Utc::now(),
                        freshness_window,
                    );
                    match verdict {
                        Ok(()) if nonce_cache.seen_or_record(&cmd.source, &cmd.nonce) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                workflow = %workflow_name,
                                subject = %msg.subject,
                                source = %cmd.source,
                                "command rejected at ingress: nonce already seen"
                            );
                            continue;
                        }
                        Ok(()) => serde_json::to_value(&cmd).unwrap_or(serde_json::Value::Null),
                        Err(e) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                workflow = %workflow_name,
                                subject = %msg.subject,
                                error = %e,
                                "command rejected at ingress"
                            );
                            continue;
                        }
                    }
                }
            };

            let job = DispatchJob {
                subject: msg.subject,
                payload,
            };
            if queue.push(job) == PushOutcome::EnqueuedDroppingOldest {
                overflow.fetch_add(1, Ordering::Relaxed);
                errors.fetch_add(1, Ordering::Relaxed);
                warn!(workflow = %workflow_name, "dispatch queue full; dropped oldest pending message");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekia_bus::{embedded::EmbeddedBus, Bus};
    use sekia_protocol::Payload;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    #[test]
    fn classifies_an_event() {
        let event = Event::new("widget.created", "agent:x", Payload::new());
        let bytes = serde_json::to_vec(&event).unwrap();
        assert!(matches!(classify(&bytes).unwrap(), Classified::Event(_)));
    }

    #[test]
    fn classifies_a_command() {
        let mut cmd = Command::unsigned("noop", "workflow:x", Payload::new());
        sekia_security::signing::sign(&mut cmd, b"k").unwrap();
        let bytes = serde_json::to_vec(&cmd).unwrap();
        assert!(matches!(classify(&bytes).unwrap(), Classified::Command(_)));
    }

    #[test]
    fn unknown_shape_is_rejected() {
        let bytes = serde_json::to_vec(&json!({"foo": "bar"})).unwrap();
        assert!(matches!(classify(&bytes), Err(DispatchError::UnknownShape)));
    }

    #[tokio::test]
    async fn replayed_nonce_is_dropped_at_ingress() {
        let bus = EmbeddedBus::new();
        let sub = bus.subscribe("sekia.command.test").await.unwrap();
        let queue = Arc::new(BoundedQueue::new(8));
        let errors = Arc::new(AtomicU64::new(0));
        let overflow = Arc::new(AtomicU64::new(0));
        let nonce_cache = Arc::new(NonceCache::new(16));

        let forwarder = spawn_subject_forwarder(
            sub,
            queue.clone(),
            Arc::new(b"secret".to_vec()),
            ChronoDuration::minutes(5),
            nonce_cache,
            errors.clone(),
            overflow,
            "wf".to_string(),
        );

        let mut cmd = Command::unsigned("noop", "agent:x", Payload::new());
        sekia_security::signing::sign(&mut cmd, b"secret").unwrap();
        let bytes = serde_json::to_vec(&cmd).unwrap();

        bus.publish("sekia.command.test", bytes.clone()).await.unwrap();
        bus.publish("sekia.command.test", bytes).await.unwrap();

        // Give the forwarder task a chance to drain both deliveries.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        forwarder.abort();

        assert_eq!(queue.len(), 1, "the replayed command must not be enqueued");
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }
}
