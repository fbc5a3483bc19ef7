// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON encoding used by command signing (§4.2) and manifest
//! hashing.
//!
//! `serde_json`'s default `Map` is `BTreeMap`-backed (the `preserve_order`
//! feature is never enabled in this workspace), so `to_string` already
//! produces a UTF-8 string with object keys sorted lexicographically, no
//! insignificant whitespace, and arrays preserved in order. This module
//! exists to name that guarantee and centralize it for callers that build
//! the signing string in §4.2.

use crate::event::Payload;
use sekia_error::{ErrorCode, SekiaError};

/// Produce the canonical JSON string for a payload map.
///
/// # Errors
///
/// Returns [`ErrorCode::ProtocolMalformed`] if any value in `payload`
/// cannot be serialized (this can only happen for NaN/infinite floats,
/// which `serde_json` refuses to encode).
pub fn canonical_json(payload: &Payload) -> Result<String, SekiaError> {
    serde_json::to_string(payload).map_err(|err| {
        SekiaError::new(ErrorCode::ProtocolMalformed, "payload is not valid JSON")
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let mut payload = Payload::new();
        payload.insert("zeta".into(), json!(1));
        payload.insert("alpha".into(), json!(2));
        let s = canonical_json(&payload).unwrap();
        assert_eq!(s, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn no_insignificant_whitespace() {
        let mut payload = Payload::new();
        payload.insert("a".into(), json!({"b": [1, 2, 3]}));
        let s = canonical_json(&payload).unwrap();
        assert!(!s.contains(' '));
    }

    #[test]
    fn deterministic_across_calls() {
        let mut payload = Payload::new();
        payload.insert("x".into(), json!("y"));
        assert_eq!(
            canonical_json(&payload).unwrap(),
            canonical_json(&payload).unwrap()
        );
    }
}
