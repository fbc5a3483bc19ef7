// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for Sekia.
//!
//! Every Sekia error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Crate-local error enums (`SecurityError`,
//! `ManifestError`, `SandboxError`, ...) convert into [`SekiaError`] at
//! crate boundaries so the daemon and control API can report one
//! consistent shape regardless of which subsystem failed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Event/command wire-format errors.
    Protocol,
    /// Command signing/verification and manifest integrity errors.
    Security,
    /// Bus connection, publish, or subscribe errors.
    Bus,
    /// Script sandbox execution errors.
    Sandbox,
    /// Workflow loader/supervisor/dispatcher errors.
    Engine,
    /// Daemon configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Security => "security",
            Self::Bus => "bus",
            Self::Sandbox => "sandbox",
            Self::Engine => "engine",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Protocol --
    /// Event or command JSON failed to parse.
    ProtocolMalformed,
    /// Subject does not match the `sekia.<section>.<...>` grammar.
    ProtocolInvalidSubject,

    // -- Security --
    /// Command signature does not match the recomputed MAC.
    SecurityBadSignature,
    /// Command timestamp fell outside the freshness window.
    SecurityExpired,
    /// Command shape could not be canonicalized for signing/verification.
    SecurityMalformed,
    /// Script directory manifest is missing or does not match the gate.
    SecurityIntegrity,

    // -- Bus --
    /// Connection to the bus could not be established or was lost.
    BusConnection,
    /// Publish failed after the connection was otherwise healthy.
    BusPublishFailed,

    // -- Sandbox --
    /// A script callback raised a Lua error.
    SandboxScriptError,
    /// A script callback exceeded its wall-clock budget.
    SandboxTimeout,
    /// A value crossing the host/script boundary could not be marshalled.
    SandboxMarshalError,
    /// A sandbox API call was made outside its allowed lifecycle phase.
    SandboxInvalidState,

    // -- Engine --
    /// A workflow script failed to initialize.
    EngineLoadFailed,
    /// A hot reload was rejected; the previous workflow remains active.
    EngineReloadRejected,

    // -- Config --
    /// Daemon configuration file or value is invalid.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ProtocolMalformed | Self::ProtocolInvalidSubject => ErrorCategory::Protocol,

            Self::SecurityBadSignature
            | Self::SecurityExpired
            | Self::SecurityMalformed
            | Self::SecurityIntegrity => ErrorCategory::Security,

            Self::BusConnection | Self::BusPublishFailed => ErrorCategory::Bus,

            Self::SandboxScriptError
            | Self::SandboxTimeout
            | Self::SandboxMarshalError
            | Self::SandboxInvalidState => ErrorCategory::Sandbox,

            Self::EngineLoadFailed | Self::EngineReloadRejected => ErrorCategory::Engine,

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"SECURITY_BAD_SIGNATURE"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolMalformed => "PROTOCOL_MALFORMED",
            Self::ProtocolInvalidSubject => "PROTOCOL_INVALID_SUBJECT",
            Self::SecurityBadSignature => "SECURITY_BAD_SIGNATURE",
            Self::SecurityExpired => "SECURITY_EXPIRED",
            Self::SecurityMalformed => "SECURITY_MALFORMED",
            Self::SecurityIntegrity => "SECURITY_INTEGRITY",
            Self::BusConnection => "BUS_CONNECTION",
            Self::BusPublishFailed => "BUS_PUBLISH_FAILED",
            Self::SandboxScriptError => "SANDBOX_SCRIPT_ERROR",
            Self::SandboxTimeout => "SANDBOX_TIMEOUT",
            Self::SandboxMarshalError => "SANDBOX_MARSHAL_ERROR",
            Self::SandboxInvalidState => "SANDBOX_INVALID_STATE",
            Self::EngineLoadFailed => "ENGINE_LOAD_FAILED",
            Self::EngineReloadRejected => "ENGINE_RELOAD_REJECTED",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SekiaError
// ---------------------------------------------------------------------------

/// Unified Sekia error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// underlying cause, and arbitrary structured context for diagnostics.
///
/// # Examples
///
/// ```
/// use sekia_error::{SekiaError, ErrorCode};
///
/// let err = SekiaError::new(ErrorCode::SecurityExpired, "command older than freshness window")
///     .with_context("age_secs", 612);
/// assert_eq!(err.code, ErrorCode::SecurityExpired);
/// ```
pub struct SekiaError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl SekiaError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if
    /// serialization fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for SekiaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SekiaError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for SekiaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SekiaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of a [`SekiaError`] (without the opaque source),
/// suitable for exposing over the control API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SekiaErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&SekiaError> for SekiaErrorDto {
    fn from(err: &SekiaError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_context() {
        let err = SekiaError::new(ErrorCode::BusConnection, "no route to broker");
        assert_eq!(err.to_string(), "[BUS_CONNECTION] no route to broker");
    }

    #[test]
    fn display_with_context() {
        let err = SekiaError::new(ErrorCode::SandboxTimeout, "callback exceeded budget")
            .with_context("budget_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[SANDBOX_TIMEOUT]"));
        assert!(s.contains("budget_ms"));
    }

    #[test]
    fn category_mapping_is_exhaustive_and_stable() {
        assert_eq!(
            ErrorCode::SecurityBadSignature.category(),
            ErrorCategory::Security
        );
        assert_eq!(
            ErrorCode::SandboxMarshalError.category(),
            ErrorCategory::Sandbox
        );
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::Config);
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::SecurityBadSignature;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""SECURITY_BAD_SIGNATURE""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = std::io::Error::new(std::io::ErrorKind::NotFound, "manifest missing");
        let err = SekiaError::new(ErrorCode::SecurityIntegrity, "integrity check failed")
            .with_source(src);
        let dto: SekiaErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("manifest missing"));
        let json = serde_json::to_string(&dto).unwrap();
        let back: SekiaErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
    }

    #[test]
    fn std_error_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = SekiaError::new(ErrorCode::Internal, "wrapped").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }
}
