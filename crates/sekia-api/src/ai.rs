// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `sekia.ai`/`sekia.ai_json` surface: an optional pluggable completion
//! client. With none configured, both calls fail softly with
//! `"ai: not configured"` rather than erroring the workflow (§4.6).

use async_trait::async_trait;

/// Per-call overrides for an [`AiClient`] completion.
#[derive(Debug, Clone, Default)]
pub struct AiOptions {
    /// Model identifier, client-specific.
    pub model: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// System prompt prepended to the request.
    pub system: Option<String>,
}

/// A pluggable text-completion backend for `sekia.ai`/`sekia.ai_json`.
///
/// No implementation ships by default; a daemon wires one in via
/// configuration (§A.3). Workflows see `"ai: not configured"` until then.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Complete `prompt` and return the raw response text.
    async fn complete(&self, prompt: &str, options: &AiOptions) -> Result<String, String>;
}
