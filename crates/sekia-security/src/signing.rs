// SPDX-License-Identifier: MIT OR Apache-2.0
//! HMAC-SHA-256 command signing and verification (§4.2).

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sekia_protocol::{canonical_json, new_event_id, Command};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised while building the canonical signing string.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// The command's payload could not be canonicalized.
    #[error("command payload is not canonicalizable: {0}")]
    Malformed(#[from] sekia_error::SekiaError),
}

/// Why a command failed verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The recomputed MAC does not match `command.signature`.
    #[error("signature does not match")]
    BadSignature,
    /// `command.timestamp` fell outside the freshness window.
    #[error("command timestamp is outside the freshness window")]
    Expired,
    /// The command could not be canonicalized, or `signature` is not hex.
    #[error("command is malformed: {0}")]
    Malformed(String),
}

fn canonical_string(cmd: &Command) -> Result<String, SigningError> {
    let payload_json = canonical_json(&cmd.payload).map_err(SigningError::Malformed)?;
    let ts = cmd.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
    Ok(format!(
        "{}\n{}\n{}\n{}\n{}",
        cmd.command, cmd.source, ts, cmd.nonce, payload_json
    ))
}

/// Sign `cmd` in place: fills `timestamp`, `nonce`, and `signature`.
///
/// When `secret` is empty, signing is a no-op on `signature` (it is left
/// empty) — the explicit insecure mode described in §4.2. Callers running
/// in this mode must log it once at startup; this function does not log,
/// since it runs per-command on the hot path.
///
/// # Errors
///
/// Returns [`SigningError::Malformed`] if the payload cannot be
/// canonicalized to JSON.
pub fn sign(cmd: &mut Command, secret: &[u8]) -> Result<(), SigningError> {
    cmd.timestamp = Utc::now();
    cmd.nonce = new_event_id();

    if secret.is_empty() {
        cmd.signature = String::new();
        return Ok(());
    }

    let canonical = canonical_string(cmd)?;
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA-256 accepts keys of any length");
    mac.update(canonical.as_bytes());
    cmd.signature = hex::encode(mac.finalize().into_bytes());
    Ok(())
}

/// Verify `cmd`'s signature and freshness.
///
/// When `secret` is empty, verification accepts any command (the insecure
/// mode paired with [`sign`]).
///
/// # Errors
///
/// - [`VerifyError::Malformed`] if the payload cannot be canonicalized or
///   `signature` is not valid hex.
/// - [`VerifyError::BadSignature`] if the recomputed MAC does not match.
/// - [`VerifyError::Expired`] if `|now - cmd.timestamp| > window`.
pub fn verify(
    cmd: &Command,
    secret: &[u8],
    now: DateTime<Utc>,
    window: Duration,
) -> Result<(), VerifyError> {
    if secret.is_empty() {
        return Ok(());
    }

    let canonical = canonical_string(cmd).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA-256 accepts keys of any length");
    mac.update(canonical.as_bytes());

    let provided = hex::decode(&cmd.signature)
        .map_err(|_| VerifyError::Malformed("signature is not valid hex".into()))?;
    mac.verify_slice(&provided)
        .map_err(|_| VerifyError::BadSignature)?;

    let delta = now.signed_duration_since(cmd.timestamp);
    let age = if delta < Duration::zero() { -delta } else { delta };
    if age > window {
        return Err(VerifyError::Expired);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekia_protocol::Payload;
    use serde_json::json;

    fn sample_command() -> Command {
        let mut payload = Payload::new();
        payload.insert("to".into(), json!("alice@example.com"));
        payload.insert("subject".into(), json!("hi"));
        Command::unsigned("send_email", "workflow:auto-reply", payload)
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        assert!(!cmd.signature.is_empty());
        assert_eq!(
            verify(&cmd, b"secret-key", Utc::now(), Duration::minutes(5)),
            Ok(())
        );
    }

    #[test]
    fn tampering_command_field_flips_verdict() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        cmd.command = "delete_everything".into();
        assert_eq!(
            verify(&cmd, b"secret-key", Utc::now(), Duration::minutes(5)),
            Err(VerifyError::BadSignature)
        );
    }

    #[test]
    fn tampering_payload_flips_verdict() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        cmd.payload.insert("subject".into(), json!("owned"));
        assert_eq!(
            verify(&cmd, b"secret-key", Utc::now(), Duration::minutes(5)),
            Err(VerifyError::BadSignature)
        );
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        cmd.signature = "0".repeat(64);
        assert_eq!(
            verify(&cmd, b"secret-key", Utc::now(), Duration::minutes(5)),
            Err(VerifyError::BadSignature)
        );
    }

    #[test]
    fn wrong_key_is_rejected() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        assert_eq!(
            verify(&cmd, b"wrong-key", Utc::now(), Duration::minutes(5)),
            Err(VerifyError::BadSignature)
        );
    }

    #[test]
    fn expired_command_is_rejected() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        let far_future = cmd.timestamp + Duration::minutes(10);
        assert_eq!(
            verify(&cmd, b"secret-key", far_future, Duration::minutes(5)),
            Err(VerifyError::Expired)
        );
    }

    #[test]
    fn future_timestamp_beyond_window_is_rejected() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        cmd.timestamp = Utc::now() + Duration::minutes(10);
        assert_eq!(
            verify(&cmd, b"secret-key", Utc::now(), Duration::minutes(5)),
            Err(VerifyError::Expired)
        );
    }

    #[test]
    fn empty_secret_is_insecure_no_op_mode() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"").unwrap();
        assert!(cmd.signature.is_empty());
        // Any signature, even a forged one, is accepted in this mode.
        let mut forged = cmd.clone();
        forged.signature = "totally-forged".into();
        assert_eq!(verify(&forged, b"", Utc::now(), Duration::minutes(5)), Ok(()));
    }

    #[test]
    fn malformed_signature_hex_is_malformed_not_bad_signature() {
        let mut cmd = sample_command();
        sign(&mut cmd, b"secret-key").unwrap();
        cmd.signature = "not-hex-zz".into();
        let err = verify(&cmd, b"secret-key", Utc::now(), Duration::minutes(5)).unwrap_err();
        assert!(matches!(err, VerifyError::Malformed(_)));
    }

    proptest::proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_keys_and_names(
            key in "[a-zA-Z0-9]{1,32}",
            command in "[a-z_]{1,20}",
            source in "[a-z:/-]{1,20}",
        ) {
            let mut cmd = Command::unsigned(command, source, Payload::new());
            sign(&mut cmd, key.as_bytes()).unwrap();
            proptest::prop_assert_eq!(
                verify(&cmd, key.as_bytes(), Utc::now(), Duration::minutes(5)),
                Ok(())
            );
        }
    }
}
