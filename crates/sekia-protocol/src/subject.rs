// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bus subject layout and wildcard pattern matching.
//!
//! Subjects are dot-separated token sequences. Subscription patterns may
//! use `*` to match exactly one token or `>` to match one or more trailing
//! tokens; `>` may only appear as the final token of a pattern.

use sekia_error::{ErrorCode, SekiaError};

/// Prefix for all Sekia bus subjects.
pub const ROOT: &str = "sekia";

/// Subject an agent/workflow publishes an [`crate::Event`] on.
///
/// `source` is the bare agent or workflow name (e.g. `"gmail"`); the
/// resulting subject is `sekia.events.<source>` or, with `subtypes`,
/// `sekia.events.<source>.<subtype...>`.
#[must_use]
pub fn event_subject(source: &str, subtypes: &[&str]) -> String {
    let mut s = format!("{ROOT}.events.{source}");
    for part in subtypes {
        s.push('.');
        s.push_str(part);
    }
    s
}

/// Subject a [`crate::Command`] is published to for a given agent.
#[must_use]
pub fn command_subject(agent: &str) -> String {
    format!("{ROOT}.commands.{agent}")
}

/// Informational heartbeat subject for an agent.
#[must_use]
pub fn heartbeat_subject(agent: &str) -> String {
    format!("{ROOT}.agents.{agent}.heartbeat")
}

/// Subject used to request a hot reload, optionally scoped to one workflow.
pub const RELOAD_SUBJECT: &str = "sekia.control.reload";

/// Validate that `pattern` is a well-formed subscription pattern: non-empty
/// tokens, and `>` (if present) only as the last token.
///
/// # Errors
///
/// Returns [`ErrorCode::ProtocolInvalidSubject`] if the pattern is empty,
/// contains an empty token (e.g. `"a..b"`), or has `>` anywhere but last.
pub fn validate_pattern(pattern: &str) -> Result<(), SekiaError> {
    if pattern.is_empty() {
        return Err(SekiaError::new(
            ErrorCode::ProtocolInvalidSubject,
            "pattern must not be empty",
        ));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_empty() {
            return Err(SekiaError::new(
                ErrorCode::ProtocolInvalidSubject,
                "pattern must not contain empty tokens",
            )
            .with_context("pattern", pattern));
        }
        if *tok == ">" && i != tokens.len() - 1 {
            return Err(SekiaError::new(
                ErrorCode::ProtocolInvalidSubject,
                "'>' may only appear as the last token",
            )
            .with_context("pattern", pattern));
        }
    }
    Ok(())
}

/// Returns `true` iff `subject` matches `pattern` under the `*`/`>` grammar.
///
/// `*` matches exactly one token; `>` matches one or more trailing tokens
/// and must be the final pattern token. Malformed patterns never match
/// anything.
///
/// # Examples
///
/// ```
/// use sekia_protocol::subject::matches;
///
/// assert!(matches("sekia.events.github.*", "sekia.events.github.push"));
/// assert!(!matches("sekia.events.github.*", "sekia.events.github.pr.opened"));
/// assert!(matches("sekia.events.github.>", "sekia.events.github.pr.opened"));
/// assert!(!matches("sekia.events.github.>", "sekia.events.gitlab.push"));
/// ```
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    if validate_pattern(pattern).is_err() {
        return false;
    }
    let pat: Vec<&str> = pattern.split('.').collect();
    let subj: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;
    while pi < pat.len() {
        match pat[pi] {
            ">" => return si < subj.len(),
            "*" => {
                if si >= subj.len() {
                    return false;
                }
                pi += 1;
                si += 1;
            }
            tok => {
                if si >= subj.len() || subj[si] != tok {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }
    si == subj.len()
}
