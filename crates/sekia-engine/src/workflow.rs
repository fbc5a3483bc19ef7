// SPDX-License-Identifier: MIT OR Apache-2.0
//! A single loaded workflow: its sandbox, its subject subscriptions, its
//! single-consumer dispatch queue, and the metrics introspection reads.

use crate::cancel::CancellationToken;
use crate::dispatch::{spawn_subject_forwarder, DispatchJob};
use crate::queue::BoundedQueue;
use crate::state::{StateMachine, WorkflowState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sekia_api::WorkflowContext;
use sekia_bus::Bus;
use sekia_sandbox::Sandbox;
use sekia_security::NonceCache;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Errors loading a single workflow (§7's `LoadError`).
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The sandbox interpreter could not be constructed.
    #[error("sandbox initialization failed: {0}")]
    Sandbox(String),
    /// Binding the `sekia` API table failed.
    #[error("api binding failed: {0}")]
    Api(String),
    /// The script errored (or timed out) during its top-level pass.
    #[error("script failed to load: {0}")]
    Script(String),
    /// Subscribing to one of the workflow's registered patterns failed.
    #[error("subscription failed: {0}")]
    Subscribe(String),
}

/// The read-only introspection view of a workflow (§4.7).
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    /// Workflow name (its file stem).
    pub name: String,
    /// Number of `sekia.on` registrations (duplicates counted).
    pub handlers_count: usize,
    /// Distinct subject patterns subscribed to.
    pub patterns: Vec<String>,
    /// Successfully completed callback invocations.
    pub events_processed: u64,
    /// Failed callback invocations (script error, timeout, or a dropped
    /// malformed/unauthenticated ingress message).
    pub errors: u64,
    /// Messages dropped because the dispatch queue was full.
    pub overflow: u64,
    /// When this workflow last finished loading (or reloading).
    pub loaded_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: WorkflowState,
}

/// A loaded workflow: sandbox, subscriptions, dispatch queue, and metrics.
pub struct WorkflowHandle {
    name: String,
    patterns: Vec<String>,
    handlers_count: usize,
    state: StateMachine,
    events_processed: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    overflow: Arc<AtomicU64>,
    loaded_at: DateTime<Utc>,
    queue: Arc<BoundedQueue<DispatchJob>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WorkflowHandle {
    /// Load `name` from `source`: build a sandbox, bind the API, run the
    /// script's top-level pass, wire subscriptions for every registered
    /// pattern, and spawn the worker that serializes this workflow's
    /// callbacks (§4.7, §5).
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if sandbox construction, API binding, the
    /// script's top-level pass, or any subscription fails. Callers should
    /// treat this as isolated to the one workflow (§4.7: "other workflows
    /// still load").
    #[allow(clippy::too_many_arguments)]
    pub async fn load(
        name: String,
        source: &str,
        ctx: WorkflowContext,
        bus: Arc<dyn Bus>,
        callback_budget: Duration,
        queue_depth: usize,
        command_secret: Arc<Vec<u8>>,
        freshness_window: ChronoDuration,
        nonce_cache: Arc<NonceCache>,
        cancel: CancellationToken,
    ) -> Result<Self, LoadError> {
        let sandbox = Sandbox::new().map_err(|e| LoadError::Sandbox(e.to_string()))?;
        let installed =
            sekia_api::install(&sandbox, ctx).map_err(|e| LoadError::Api(e.to_string()))?;

        installed.load_phase.store(true, Ordering::SeqCst);
        let load_result = sandbox.load(&name, source, callback_budget).await;
        installed.load_phase.store(false, Ordering::SeqCst);
        load_result.map_err(|e| LoadError::Script(e.to_string()))?;

        let (handlers_count, patterns) = {
            let guard = installed.handlers.lock().unwrap();
            let count = guard.len();
            let set: BTreeSet<String> = guard.iter().map(|h| h.pattern.clone()).collect();
            (count, set.into_iter().collect::<Vec<_>>())
        };

        let queue = Arc::new(BoundedQueue::new(queue_depth));
        let events_processed = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));
        let overflow = Arc::new(AtomicU64::new(0));

        let mut forwarders = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            let subscription = bus
                .subscribe(pattern)
                .await
                .map_err(|e| LoadError::Subscribe(e.to_string()))?;
            forwarders.push(spawn_subject_forwarder(
                subscription,
                queue.clone(),
                command_secret.clone(),
                freshness_window,
                nonce_cache.clone(),
                errors.clone(),
                overflow.clone(),
                name.clone(),
            ));
        }

        let worker = tokio::spawn(run_worker(
            sandbox,
            installed.handlers,
            queue.clone(),
            callback_budget,
            events_processed.clone(),
            errors.clone(),
            cancel.clone(),
        ));

        let state = StateMachine::new();
        state
            .transition(WorkflowState::Loading)
            .expect("Discovered -> Loading is always valid");
        state
            .transition(WorkflowState::Ready)
            .expect("Loading -> Ready is always valid once load succeeded");

        Ok(Self {
            name,
            patterns,
            handlers_count,
            state,
            events_processed,
            errors,
            overflow,
            loaded_at: Utc::now(),
            queue,
            worker: Mutex::new(Some(worker)),
            forwarders: Mutex::new(forwarders),
            cancel,
        })
    }

    /// This workflow's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkflowState {
        self.state.current()
    }

    /// An introspection snapshot (§4.7).
    #[must_use]
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            name: self.name.clone(),
            handlers_count: self.handlers_count,
            patterns: self.patterns.clone(),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            loaded_at: self.loaded_at,
            state: self.state.current(),
        }
    }

    /// Stop accepting new messages, let the in-flight callback finish up
    /// to `grace`, then tear down the sandbox (§4.7 hot-reload drain,
    /// §5 shutdown).
    pub async fn drain(&self, grace: Duration) {
        let _ = self.state.transition(WorkflowState::Draining);
        self.queue.close();
        self.cancel.cancel();
        for forwarder in self.forwarders.lock().unwrap().drain(..) {
            forwarder.abort();
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!(
                    workflow = %self.name,
                    grace_ms = grace.as_millis(),
                    "drain exceeded grace period; worker callback may still be running"
                );
            }
        }
        let _ = self.state.transition(WorkflowState::Terminated);
    }
}

async fn run_worker(
    sandbox: Sandbox,
    handlers: sekia_api::HandlerRegistry,
    queue: Arc<BoundedQueue<DispatchJob>>,
    budget: Duration,
    events_processed: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => return,
            job = queue.pop() => job,
        };
        let Some(job) = job else { return };

        let matching: Vec<mlua::Function> = {
            let guard = handlers.lock().unwrap();
            guard
                .iter()
                .filter(|entry| sekia_protocol::subject::matches(&entry.pattern, &job.subject))
                .filter_map(|entry| sandbox.lua().registry_value::<mlua::Function>(&entry.key).ok())
                .collect()
        };

        for func in matching {
            match sandbox.call(func, &job.payload, budget).await {
                Ok(()) => {
                    events_processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subject = %job.subject, error = %e, "workflow callback failed");
                }
            }
        }
    }
}
