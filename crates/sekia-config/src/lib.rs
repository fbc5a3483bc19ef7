// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon runtime configuration: TOML file plus environment overrides.
//!
//! Secrets never live in the TOML file. [`RuntimeSecrets::from_env`] reads
//! `SEKIA_COMMAND_SECRET` (§4.2) and `SEKIA_NATS_TOKEN` directly from the
//! process environment; nothing else in this crate touches either name.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Errors loading or validating a [`SekiaConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file does not exist or is unreadable.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file's contents are not valid TOML, or don't match the schema.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// One or more fields failed semantic validation.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level configuration issues that don't prevent startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended field was left at its default.
    MissingOptionalField {
        /// Field name.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// `callback_timeout_secs` is large enough to stall dispatch noticeably.
    LargeCallbackTimeout {
        /// Configured timeout, in seconds.
        secs: u64,
    },
    /// Replay protection (§9) is disabled; commands with reused nonces are
    /// not rejected.
    ReplayProtectionDisabled,
    /// Manifest integrity checking (§4.3) is disabled; scripts load even
    /// if the directory hash doesn't match the last known-good one.
    IntegrityCheckDisabled,
    /// No command-signing secret is configured; commands are accepted
    /// unauthenticated (§4.2's explicit insecure mode).
    NoCommandSecretConfigured,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            Self::LargeCallbackTimeout { secs } => {
                write!(f, "callback_timeout_secs is unusually large ({secs}s)")
            }
            Self::ReplayProtectionDisabled => write!(f, "replay protection is disabled"),
            Self::IntegrityCheckDisabled => write!(f, "manifest integrity checking is disabled"),
            Self::NoCommandSecretConfigured => {
                write!(f, "no command-signing secret configured; running unauthenticated")
            }
        }
    }
}

/// Which [`sekia_bus::Bus`] implementation the daemon starts.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusMode {
    /// In-process broker, no external dependency (§4.4).
    #[default]
    Embedded,
    /// External NATS server.
    Nats,
}

const fn default_callback_timeout_secs() -> u64 {
    5
}

const fn default_queue_depth() -> usize {
    256
}

const fn default_freshness_window_secs() -> i64 {
    sekia_protocol::DEFAULT_FRESHNESS_WINDOW_SECS
}

const fn default_reload_grace_secs() -> u64 {
    5
}

fn default_bind_address() -> String {
    "127.0.0.1:8077".to_string()
}

fn default_script_dir() -> PathBuf {
    PathBuf::from("./workflows")
}

const fn default_true() -> bool {
    true
}

/// Top-level daemon runtime configuration (§A.3).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SekiaConfig {
    /// Which bus implementation to start.
    pub bus_mode: BusMode,
    /// NATS server URL. Required when `bus_mode = "nats"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_url: Option<String>,
    /// Directory workflows are discovered in (§4.3).
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,
    /// Require the script directory's manifest hash to match before
    /// loading any workflow (§4.3). Disabling this is an explicit
    /// insecure opt-out.
    #[serde(default = "default_true")]
    pub integrity_required: bool,
    /// Per-callback wall-clock budget, in seconds (§4.5).
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
    /// Bounded per-workflow dispatch queue depth (§5).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Command freshness window, in seconds (§4.2).
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: i64,
    /// Bounded grace period for a hot-reload drain, in seconds (§4.7).
    #[serde(default = "default_reload_grace_secs")]
    pub reload_grace_secs: u64,
    /// Local control HTTP API bind address (§6).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Replay-protection nonce cache capacity; `0` disables it (§9).
    #[serde(default)]
    pub replay_cache_size: usize,
    /// Log level passed to `tracing_subscriber`'s env filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for SekiaConfig {
    fn default() -> Self {
        Self {
            bus_mode: BusMode::default(),
            bus_url: None,
            script_dir: default_script_dir(),
            integrity_required: true,
            callback_timeout_secs: default_callback_timeout_secs(),
            queue_depth: default_queue_depth(),
            freshness_window_secs: default_freshness_window_secs(),
            reload_grace_secs: default_reload_grace_secs(),
            bind_address: default_bind_address(),
            replay_cache_size: 0,
            log_level: Some("info".to_string()),
        }
    }
}

/// Secrets read directly from the process environment, never from TOML.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSecrets {
    /// HMAC key for command signing (§4.2). Empty means the explicit
    /// insecure no-op mode.
    pub command_secret: Vec<u8>,
    /// Bearer token for the NATS connection, if any.
    pub nats_token: Option<String>,
}

impl RuntimeSecrets {
    /// Read secrets from `SEKIA_COMMAND_SECRET` and `SEKIA_NATS_TOKEN`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            command_secret: std::env::var("SEKIA_COMMAND_SECRET")
                .map(String::into_bytes)
                .unwrap_or_default(),
            nats_token: std::env::var("SEKIA_NATS_TOKEN").ok(),
        }
    }
}

/// Load a [`SekiaConfig`] from an optional TOML file, applying environment
/// overrides on top either way.
pub fn load_config(path: Option<&Path>) -> Result<SekiaConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => SekiaConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`SekiaConfig`].
pub fn parse_toml(content: &str) -> Result<SekiaConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Non-secret overrides: `SEKIA_BIND_ADDRESS`, `SEKIA_SCRIPT_DIR`,
/// `SEKIA_LOG_LEVEL`.
pub fn apply_env_overrides(config: &mut SekiaConfig) {
    if let Ok(v) = std::env::var("SEKIA_BIND_ADDRESS") {
        config.bind_address = v;
    }
    if let Ok(v) = std::env::var("SEKIA_SCRIPT_DIR") {
        config.script_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("SEKIA_LOG_LEVEL") {
        config.log_level = Some(v);
    }
}

const MAX_CALLBACK_TIMEOUT_SECS: u64 = 300;
const LARGE_CALLBACK_TIMEOUT_THRESHOLD_SECS: u64 = 30;

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (bad ranges, a NATS mode with no URL) come back as
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &SekiaConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.bus_mode == BusMode::Nats && config.bus_url.as_deref().unwrap_or("").is_empty() {
        errors.push("bus_mode = \"nats\" requires bus_url".to_string());
    }

    if config.callback_timeout_secs == 0 || config.callback_timeout_secs > MAX_CALLBACK_TIMEOUT_SECS {
        errors.push(format!(
            "callback_timeout_secs {} out of range (1..{MAX_CALLBACK_TIMEOUT_SECS})",
            config.callback_timeout_secs
        ));
    } else if config.callback_timeout_secs > LARGE_CALLBACK_TIMEOUT_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeCallbackTimeout {
            secs: config.callback_timeout_secs,
        });
    }

    if config.queue_depth == 0 {
        errors.push("queue_depth must be at least 1".to_string());
    }

    if config.freshness_window_secs <= 0 {
        errors.push("freshness_window_secs must be positive".to_string());
    }

    if config.bind_address.trim().is_empty() {
        errors.push("bind_address must not be empty".to_string());
    }

    if !config.integrity_required {
        warnings.push(ConfigWarning::IntegrityCheckDisabled);
    }
    if config.replay_cache_size == 0 {
        warnings.push(ConfigWarning::ReplayProtectionDisabled);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Advisory warnings derived from the process environment rather than the
/// TOML file (kept separate so [`validate_config`] never needs secrets).
#[must_use]
pub fn warn_on_secrets(secrets: &RuntimeSecrets) -> Vec<ConfigWarning> {
    if secrets.command_secret.is_empty() {
        vec![ConfigWarning::NoCommandSecretConfigured]
    } else {
        Vec::new()
    }
}
