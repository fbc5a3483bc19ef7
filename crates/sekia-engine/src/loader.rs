// SPDX-License-Identifier: MIT OR Apache-2.0
//! Discovery, the integrity gate, and per-workflow load isolation (§4.7).

use crate::cancel::CancellationToken;
use crate::workflow::{LoadError, WorkflowHandle};
use chrono::Duration as ChronoDuration;
use sekia_api::{AiClient, WorkflowContext};
use sekia_bus::Bus;
use sekia_security::manifest::{self, DEFAULT_SCRIPT_EXTENSION};
use sekia_security::NonceCache;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Fatal errors discovering or gating the script directory (§7's
/// `IntegrityError`, plus plain I/O failure enumerating it).
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Manifest verification failed while integrity checking was required.
    #[error("integrity check failed: {0}")]
    Integrity(#[from] manifest::ManifestError),
    /// The script directory itself could not be read.
    #[error("could not read script directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything [`load_all`] needs beyond the directory path.
pub struct LoadPlan {
    /// Directory workflows are discovered in.
    pub script_dir: std::path::PathBuf,
    /// Require a matching `workflows.sha256` before loading anything.
    pub integrity_required: bool,
    /// Shared bus handle every workflow subscribes and publishes through.
    pub bus: Arc<dyn Bus>,
    /// Per-callback wall-clock budget (§4.5).
    pub callback_budget: Duration,
    /// Per-workflow bounded dispatch queue depth (§5).
    pub queue_depth: usize,
    /// HMAC key for `sekia.command` and ingress verification (§4.2).
    pub command_secret: Arc<Vec<u8>>,
    /// Command freshness window (§4.2).
    pub freshness_window: ChronoDuration,
    /// Replay cache shared across every workflow's ingress (§9). Built
    /// once per [`crate::Engine`] and survives reloads, since resetting
    /// it on every reload would make replay protection trivially
    /// defeatable by triggering one.
    pub nonce_cache: Arc<NonceCache>,
    /// Optional AI backend bound into every workflow's `sekia.ai*`.
    pub ai_client: Option<Arc<dyn AiClient>>,
}

/// The result of a load pass: workflows that came up, and workflows whose
/// script failed (kept by name, with the reason, per §4.7's failure
/// isolation — "other workflows still load").
pub struct LoadOutcome {
    /// Successfully loaded workflows, keyed by name.
    pub loaded: BTreeMap<String, Arc<WorkflowHandle>>,
    /// Workflows whose script failed to load.
    pub failed: BTreeMap<String, LoadError>,
}

/// Run the integrity gate (if enabled) and load every script in
/// `plan.script_dir`, in lexicographic order, isolating failures to the
/// offending workflow.
///
/// # Errors
///
/// Returns [`DiscoveryError`] if integrity verification is required and
/// fails, or if the directory can't be read at all. Per-workflow script
/// failures are *not* returned as an error — they land in
/// [`LoadOutcome::failed`] instead.
pub async fn load_all(plan: &LoadPlan) -> Result<LoadOutcome, DiscoveryError> {
    if plan.integrity_required {
        manifest::verify(&plan.script_dir, DEFAULT_SCRIPT_EXTENSION).await?;
    }

    let mut files = manifest::list_scripts(&plan.script_dir, DEFAULT_SCRIPT_EXTENSION).await?;
    files.sort();

    let mut loaded = BTreeMap::new();
    let mut failed = BTreeMap::new();

    for path in files {
        let name = workflow_name(&path);
        let source = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) => {
                failed.insert(name, LoadError::Script(format!("could not read script: {e}")));
                continue;
            }
        };

        let ctx = WorkflowContext {
            workflow_name: name.clone(),
            bus: plan.bus.clone(),
            command_secret: plan.command_secret.clone(),
            ai_client: plan.ai_client.clone(),
        };

        match WorkflowHandle::load(
            name.clone(),
            &source,
            ctx,
            plan.bus.clone(),
            plan.callback_budget,
            plan.queue_depth,
            plan.command_secret.clone(),
            plan.freshness_window,
            plan.nonce_cache.clone(),
            CancellationToken::new(),
        )
        .await
        {
            Ok(handle) => {
                loaded.insert(name, Arc::new(handle));
            }
            Err(e) => {
                tracing::warn!(workflow = %name, error = %e, "workflow failed to load");
                failed.insert(name, e);
            }
        }
    }

    Ok(LoadOutcome { loaded, failed })
}

fn workflow_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
