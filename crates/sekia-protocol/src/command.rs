// SPDX-License-Identifier: MIT OR Apache-2.0
//! The [`Command`] record: an authenticated request dispatched to an agent.

use crate::event::Payload;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default freshness window (§3): a command older (or newer) than this
/// relative to the verifier's clock is rejected as
/// `sekia_security::signing::VerifyError::Expired`.
pub const DEFAULT_FRESHNESS_WINDOW_SECS: i64 = 300;

/// A signed, authenticated request to an agent.
///
/// `signature` is only meaningful once `sekia_security::signing::sign`
/// has been called; a freshly built `Command` carries an empty signature.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Command {
    /// Short command name, e.g. `"send_email"`.
    pub command: String,

    /// Command-specific arguments.
    pub payload: Payload,

    /// Issuer identifier, e.g. `"workflow:auto-reply"`.
    pub source: String,

    /// UTC instant the command was signed.
    pub timestamp: DateTime<Utc>,

    /// Random 128-bit value, unique per command, hex-encoded.
    pub nonce: String,

    /// Hex-encoded HMAC-SHA-256 over the canonical command bytes.
    ///
    /// Empty until `sekia_security::signing::sign` fills it in.
    #[serde(default)]
    pub signature: String,

    /// Unrecognized top-level fields, preserved verbatim for forwarding.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Command {
    /// Build an unsigned command. `timestamp`, `nonce`, and `signature`
    /// are placeholders until `sekia_security::signing::sign` is called.
    #[must_use]
    pub fn unsigned(command: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            command: command.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
            nonce: String::new(),
            signature: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let mut payload = Payload::new();
        payload.insert("to".into(), json!("alice@example.com"));
        let cmd = Command::unsigned("send_email", "workflow:auto-reply", payload);
        let wire = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn unsigned_command_has_empty_signature() {
        let cmd = Command::unsigned("noop", "workflow:x", Payload::new());
        assert!(cmd.signature.is_empty());
        assert!(cmd.nonce.is_empty());
    }
}
