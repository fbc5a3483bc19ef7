// SPDX-License-Identifier: MIT OR Apache-2.0
//! A read-only view of external agents, built entirely from what they
//! choose to broadcast on `sekia.agents.*.heartbeat` (§3). Agents
//! themselves are out of scope (§1); this is the thin adapter §6 asks
//! the control endpoint to expose.

use chrono::{DateTime, Utc};
use sekia_bus::Bus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Last-known state of one agent, derived from its most recent heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    /// Agent name, taken from the heartbeat subject's middle token.
    pub name: String,
    /// Free-form version string, if the heartbeat payload included one.
    pub version: Option<String>,
    /// Free-form status string, if the heartbeat payload included one.
    pub status: Option<String>,
    /// `events_processed` counter, if the heartbeat payload included one.
    pub events_processed: u64,
    /// `errors` counter, if the heartbeat payload included one.
    pub errors: u64,
    /// When this heartbeat was received.
    pub last_heartbeat: DateTime<Utc>,
}

/// Thread-safe table of the most recent heartbeat per agent name.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<BTreeMap<String, AgentInfo>>>,
}

impl AgentRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct agents seen so far.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// All known agents, sorted by name.
    pub async fn snapshot(&self) -> Vec<AgentInfo> {
        self.inner.read().await.values().cloned().collect()
    }

    async fn record(&self, name: String, payload: &serde_json::Value) {
        let info = AgentInfo {
            name: name.clone(),
            version: payload.get("version").and_then(|v| v.as_str()).map(str::to_string),
            status: payload.get("status").and_then(|v| v.as_str()).map(str::to_string),
            events_processed: payload.get("events_processed").and_then(serde_json::Value::as_u64).unwrap_or(0),
            errors: payload.get("errors").and_then(serde_json::Value::as_u64).unwrap_or(0),
            last_heartbeat: Utc::now(),
        };
        self.inner.write().await.insert(name, info);
    }
}

/// Parse the agent name out of a `sekia.agents.<name>.heartbeat` subject.
fn agent_name_from_subject(subject: &str) -> Option<&str> {
    let rest = subject.strip_prefix("sekia.agents.")?;
    rest.strip_suffix(".heartbeat")
}

/// Spawn the task that subscribes to `sekia.agents.*.heartbeat` and keeps
/// `registry` up to date for as long as `bus` stays alive.
pub fn spawn_heartbeat_listener(bus: Arc<dyn Bus>, registry: AgentRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sub = match bus.subscribe("sekia.agents.*.heartbeat").await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "could not subscribe to agent heartbeats");
                return;
            }
        };
        while let Some(msg) = sub.recv().await {
            let Some(name) = agent_name_from_subject(&msg.subject) else {
                continue;
            };
            let payload: serde_json::Value = match serde_json::from_slice(&msg.payload) {
                Ok(v) => v,
                Err(_) => serde_json::Value::Null,
            };
            registry.record(name.to_string(), &payload).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekia_bus::embedded::EmbeddedBus;

    #[test]
    fn parses_agent_name_out_of_heartbeat_subject() {
        assert_eq!(agent_name_from_subject("sekia.agents.gmail-agent.heartbeat"), Some("gmail-agent"));
        assert_eq!(agent_name_from_subject("sekia.events.gmail"), None);
    }

    #[tokio::test]
    async fn heartbeat_updates_the_registry() {
        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        let registry = AgentRegistry::new();
        spawn_heartbeat_listener(bus.clone(), registry.clone());
        tokio::task::yield_now().await;

        let payload = serde_json::to_vec(&serde_json::json!({"status": "ok", "events_processed": 3})).unwrap();
        bus.publish("sekia.agents.gmail-agent.heartbeat", payload).await.unwrap();

        for _ in 0..50 {
            if registry.len().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "gmail-agent");
        assert_eq!(snapshot[0].status.as_deref(), Some("ok"));
    }
}
