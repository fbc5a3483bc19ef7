// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Sekia engine: discovers, loads, dispatches to, and reloads
//! workflows (§4.7, §4.8, §4.9, §5).
//!
//! [`Engine`] is the supervisor the daemon binary drives. It owns the
//! script directory's integrity gate, the set of loaded [`WorkflowHandle`]s,
//! and the failure table for scripts that didn't load, and exposes the
//! reload/shutdown/introspection operations the control API surfaces.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod dispatch;
mod loader;
mod queue;
mod state;
mod workflow;

pub use cancel::CancellationToken;
pub use dispatch::{classify, Classified, DispatchError, DispatchJob};
pub use loader::{load_all, DiscoveryError, LoadOutcome, LoadPlan};
pub use queue::{BoundedQueue, PushOutcome};
pub use state::{InvalidTransition, StateMachine, WorkflowState};
pub use workflow::{LoadError, WorkflowHandle, WorkflowSnapshot};

use chrono::Duration as ChronoDuration;
use sekia_api::AiClient;
use sekia_bus::Bus;
use sekia_config::SekiaConfig;
use sekia_security::NonceCache;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A single reload attempt's outcome, returned to the control API so it
/// can report per-workflow success/failure (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReloadReport {
    /// Workflow name that was (re)loaded.
    pub name: String,
    /// `true` if the reload succeeded and replaced the running workflow.
    pub ok: bool,
    /// Failure detail, present only when `ok` is `false`.
    pub error: Option<String>,
}

/// Everything the engine needs to load and reload workflows, held for the
/// lifetime of the daemon.
struct EngineConfig {
    script_dir: PathBuf,
    integrity_required: bool,
    bus: Arc<dyn Bus>,
    callback_budget: Duration,
    queue_depth: usize,
    command_secret: Arc<Vec<u8>>,
    freshness_window: ChronoDuration,
    /// Shared across every load/reload for the engine's lifetime — see
    /// [`LoadPlan::nonce_cache`].
    nonce_cache: Arc<NonceCache>,
    ai_client: Option<Arc<dyn AiClient>>,
}

impl EngineConfig {
    fn plan(&self) -> LoadPlan {
        LoadPlan {
            script_dir: self.script_dir.clone(),
            integrity_required: self.integrity_required,
            bus: self.bus.clone(),
            callback_budget: self.callback_budget,
            queue_depth: self.queue_depth,
            command_secret: self.command_secret.clone(),
            freshness_window: self.freshness_window,
            nonce_cache: self.nonce_cache.clone(),
            ai_client: self.ai_client.clone(),
        }
    }
}

/// The running set of workflows plus the supervisor operations over them.
pub struct Engine {
    config: EngineConfig,
    workflows: RwLock<BTreeMap<String, Arc<WorkflowHandle>>>,
    failed: RwLock<BTreeMap<String, String>>,
    reload_grace: Duration,
}

impl Engine {
    /// Build an engine from a loaded [`SekiaConfig`], a bus, the resolved
    /// command secret, and an optional AI backend. Does not load any
    /// workflows yet — call [`Engine::start`] for that.
    #[must_use]
    pub fn new(
        cfg: &SekiaConfig,
        bus: Arc<dyn Bus>,
        command_secret: Arc<Vec<u8>>,
        ai_client: Option<Arc<dyn AiClient>>,
    ) -> Self {
        Self {
            config: EngineConfig {
                script_dir: cfg.script_dir.clone(),
                integrity_required: cfg.integrity_required,
                bus,
                callback_budget: Duration::from_secs(cfg.callback_timeout_secs),
                queue_depth: cfg.queue_depth,
                command_secret,
                freshness_window: ChronoDuration::seconds(cfg.freshness_window_secs),
                nonce_cache: Arc::new(NonceCache::new(cfg.replay_cache_size)),
                ai_client,
            },
            workflows: RwLock::new(BTreeMap::new()),
            failed: RwLock::new(BTreeMap::new()),
            reload_grace: Duration::from_secs(cfg.reload_grace_secs),
        }
    }

    /// Run the integrity gate and load every workflow under the script
    /// directory (§4.7). Call once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if integrity verification is required
    /// and fails, or the script directory can't be read. Individual
    /// workflow failures are recorded internally, not returned as an
    /// error — see [`Engine::failed_workflows`].
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let outcome = load_all(&self.config.plan()).await?;
        for (name, err) in outcome.failed {
            tracing::warn!(workflow = %name, error = %err, "workflow did not load at startup");
            self.failed.write().await.insert(name, err.to_string());
        }
        *self.workflows.write().await = outcome.loaded;
        Ok(())
    }

    /// Reload every workflow currently on disk. Per §4.7's atomicity
    /// guarantee, a workflow whose new script fails to load keeps running
    /// its previous, still-`Ready` instance untouched.
    pub async fn reload_all(&self) -> Vec<ReloadReport> {
        let plan = self.config.plan();
        let outcome = match loader::load_all(&plan).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "reload aborted: integrity gate failed");
                return vec![ReloadReport {
                    name: "*".to_string(),
                    ok: false,
                    error: Some(e.to_string()),
                }];
            }
        };

        let mut reports = Vec::new();
        let mut old_instances = Vec::new();
        {
            let mut workflows = self.workflows.write().await;
            let mut failed = self.failed.write().await;
            for (name, handle) in outcome.loaded {
                if let Some(old) = workflows.insert(name.clone(), handle) {
                    old_instances.push(old);
                }
                failed.remove(&name);
                reports.push(ReloadReport { name, ok: true, error: None });
            }
            for (name, err) in outcome.failed {
                failed.insert(name.clone(), err.to_string());
                reports.push(ReloadReport { name, ok: false, error: Some(err.to_string()) });
            }
        }
        for old in old_instances {
            old.drain(self.reload_grace).await;
        }
        reports
    }

    /// Reload a single workflow by name. Leaves the previous instance
    /// running untouched if the new script fails to load (§4.7).
    pub async fn reload_one(&self, name: &str) -> ReloadReport {
        let path = self.config.script_dir.join(format!("{name}.lua"));
        let source = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) => {
                return ReloadReport {
                    name: name.to_string(),
                    ok: false,
                    error: Some(format!("could not read script: {e}")),
                }
            }
        };

        if self.config.integrity_required {
            if let Err(e) =
                sekia_security::manifest::verify(&self.config.script_dir, sekia_security::manifest::DEFAULT_SCRIPT_EXTENSION)
                    .await
            {
                return ReloadReport {
                    name: name.to_string(),
                    ok: false,
                    error: Some(format!("integrity check failed: {e}")),
                };
            }
        }

        let ctx = sekia_api::WorkflowContext {
            workflow_name: name.to_string(),
            bus: self.config.bus.clone(),
            command_secret: self.config.command_secret.clone(),
            ai_client: self.config.ai_client.clone(),
        };

        let result = WorkflowHandle::load(
            name.to_string(),
            &source,
            ctx,
            self.config.bus.clone(),
            self.config.callback_budget,
            self.config.queue_depth,
            self.config.command_secret.clone(),
            self.config.freshness_window,
            self.config.nonce_cache.clone(),
            CancellationToken::new(),
        )
        .await;

        match result {
            Ok(handle) => {
                let old = self.workflows.write().await.insert(name.to_string(), Arc::new(handle));
                self.failed.write().await.remove(name);
                if let Some(old) = old {
                    old.drain(self.reload_grace).await;
                }
                ReloadReport { name: name.to_string(), ok: true, error: None }
            }
            Err(e) => {
                tracing::warn!(workflow = %name, error = %e, "reload failed; previous instance kept running");
                self.failed.write().await.insert(name.to_string(), e.to_string());
                ReloadReport { name: name.to_string(), ok: false, error: Some(e.to_string()) }
            }
        }
    }

    /// Snapshot every loaded workflow (§4.7 introspection, §6 `GET /workflows`).
    pub async fn snapshots(&self) -> Vec<WorkflowSnapshot> {
        self.workflows.read().await.values().map(|h| h.snapshot()).collect()
    }

    /// Names and reasons of workflows that failed to load (startup or
    /// reload), kept until a subsequent successful reload clears them.
    pub async fn failed_workflows(&self) -> BTreeMap<String, String> {
        self.failed.read().await.clone()
    }

    /// Subscribe to `sekia.control.reload` (§4.7, §6) and react to every
    /// message: a JSON body with a `target` string reloads that one
    /// workflow via [`Engine::reload_one`]; any other body (including an
    /// empty one) reloads everything via [`Engine::reload_all`]. This is
    /// the bus-triggered counterpart to the control API's `POST
    /// /workflows/reload`/`POST /config/reload` routes, which call the
    /// same two methods directly.
    #[must_use]
    pub fn spawn_reload_listener(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = self.config.bus.clone();
        tokio::spawn(async move {
            let mut sub = match bus.subscribe(sekia_protocol::subject::RELOAD_SUBJECT).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "could not subscribe to reload control subject");
                    return;
                }
            };
            while let Some(msg) = sub.recv().await {
                let target = serde_json::from_slice::<serde_json::Value>(&msg.payload)
                    .ok()
                    .and_then(|v| v.get("target").and_then(|t| t.as_str()).map(str::to_string));
                match target {
                    Some(name) => {
                        let report = self.reload_one(&name).await;
                        if !report.ok {
                            tracing::warn!(
                                workflow = %name,
                                error = ?report.error,
                                "bus-triggered reload failed"
                            );
                        }
                    }
                    None => {
                        for report in self.reload_all().await.into_iter().filter(|r| !r.ok) {
                            tracing::warn!(
                                workflow = %report.name,
                                error = ?report.error,
                                "bus-triggered reload failed"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Gracefully drain and stop every workflow (§5 shutdown).
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<Arc<WorkflowHandle>> = self.workflows.read().await.values().cloned().collect();
        let tasks: Vec<_> = handles
            .into_iter()
            .map(|h| {
                let grace = grace;
                tokio::spawn(async move { h.drain(grace).await })
            })
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekia_bus::embedded::EmbeddedBus;

    fn test_config(script_dir: PathBuf) -> SekiaConfig {
        let mut cfg = SekiaConfig::default();
        cfg.script_dir = script_dir;
        cfg.integrity_required = false;
        cfg
    }

    #[tokio::test]
    async fn start_loads_scripts_and_ignores_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("good.lua"), b"sekia.on('a.b', function() end)")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("bad.lua"), b"this is not lua (((")
            .await
            .unwrap();

        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        let engine = Engine::new(
            &test_config(dir.path().to_path_buf()),
            bus,
            Arc::new(b"secret".to_vec()),
            None,
        );
        engine.start().await.unwrap();

        let snapshots = engine.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "good");

        let failed = engine.failed_workflows().await;
        assert!(failed.contains_key("bad"));
    }

    #[tokio::test]
    async fn reload_one_keeps_old_instance_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("w.lua"), b"sekia.on('a.b', function() end)")
            .await
            .unwrap();

        let bus: Arc<dyn Bus> = Arc::new(EmbeddedBus::new());
        let engine = Engine::new(
            &test_config(dir.path().to_path_buf()),
            bus,
            Arc::new(b"secret".to_vec()),
            None,
        );
        engine.start().await.unwrap();
        assert_eq!(engine.snapshots().await.len(), 1);

        tokio::fs::write(dir.path().join("w.lua"), b"((( not lua")
            .await
            .unwrap();
        let report = engine.reload_one("w").await;
        assert!(!report.ok);

        // Old instance is still there and still Ready.
        let snapshots = engine.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, WorkflowState::Ready);
    }
}
