//! Concrete adapters: the Ollama model backend and the anchor proxy
//! client.

use async_trait::async_trait;
use edgecoder_common::retry::{retry_with_backoff, RetryPolicy};
use edgecoder_coordinator::{GenerationOutput, ModelBackend, ModelInfo};
use edgecoder_ledger::{AnchorAdapter, AnchorError, AnchorStatus};
use edgecoder_primitives::Buf32;
use serde::Deserialize;
use tracing::debug;

/// Client for an Ollama-compatible HTTP backend.
pub(crate) struct OllamaBackend {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    /// Total wall time in nanoseconds.
    #[serde(default)]
    total_duration: u64,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

impl OllamaBackend {
    pub(crate) fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }
}

/// Parses a parameter size in billions out of a model tag like
/// `qwen2.5-coder:7b` or `llama3:1.5b-instruct`.
pub(crate) fn parse_param_size(name: &str) -> Option<f64> {
    let tag = name.split(':').nth(1)?;
    let digits: String = tag
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() || !tag[digits.len()..].starts_with('b') {
        return None;
    }
    digits.parse().ok()
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<GenerationOutput, anyhow::Error> {
        let response: OllamaGenerateResponse = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&serde_json::json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(GenerationOutput {
            output: response.response,
            cpu_seconds: response.total_duration as f64 / 1e9,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, anyhow::Error> {
        let response: OllamaTagsResponse = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .models
            .into_iter()
            .map(|m| ModelInfo {
                param_size: parse_param_size(&m.name),
                name: m.name,
            })
            .collect())
    }

    async fn health(&self) -> bool {
        self.http
            .get(&self.base_url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// HTTP client for the external anchor proxy. Submissions retry with the
/// standard transient backoff; the proxy deduplicates by checkpoint hash,
/// making resubmission safe.
pub(crate) struct HttpAnchorClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AnchorSubmitResponse {
    anchor_ref: String,
}

#[derive(Debug, Deserialize)]
struct AnchorLookupResponse {
    status: String,
}

impl HttpAnchorClient {
    pub(crate) fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AnchorAdapter for HttpAnchorClient {
    async fn submit(&self, checkpoint_hash: Buf32) -> Result<String, AnchorError> {
        let response = retry_with_backoff(RetryPolicy::default(), "anchor_submit", || async {
            self.http
                .post(format!("{}/anchor", self.base_url))
                .json(&serde_json::json!({ "checkpoint_hash": checkpoint_hash }))
                .send()
                .await?
                .error_for_status()?
                .json::<AnchorSubmitResponse>()
                .await
        })
        .await
        .map_err(|e| AnchorError::Unreachable(e.to_string()))?;

        debug!(anchor_ref = %response.anchor_ref, "checkpoint anchored");
        Ok(response.anchor_ref)
    }

    async fn lookup(&self, anchor_ref: &str) -> Result<AnchorStatus, AnchorError> {
        let response = self
            .http
            .get(format!("{}/anchor/{anchor_ref}", self.base_url))
            .send()
            .await
            .map_err(|e| AnchorError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Ok(AnchorStatus::Unknown);
        }
        let body: AnchorLookupResponse = response
            .json()
            .await
            .map_err(|e| AnchorError::Unreachable(e.to_string()))?;
        Ok(match body.status.as_str() {
            "confirmed" => AnchorStatus::Confirmed,
            "pending" => AnchorStatus::Pending,
            _ => AnchorStatus::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_size_parses_common_tags() {
        assert_eq!(parse_param_size("qwen2.5-coder:7b"), Some(7.0));
        assert_eq!(parse_param_size("qwen:1.5b"), Some(1.5));
        assert_eq!(parse_param_size("llama3:1.5b-instruct"), Some(1.5));
        assert_eq!(parse_param_size("mistral:latest"), None);
        assert_eq!(parse_param_size("plainmodel"), None);
    }
}
