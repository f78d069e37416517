//! Direct-provider Backend (Ollama-style local completion endpoint).
//!
//! Grounded on `kowalski-rlm/src/exo_cluster_manager.rs`'s
//! `reqwest::ClientBuilder` pooling conventions, adapted to the single
//! `/api/generate`-style request/response shape a locally hosted model
//! server exposes (no Bearer auth, no OpenAI-compatible `choices[]`
//! envelope) per `spec.md` §4.1's "direct-provider" Backend variant.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rlm_core::{ModelUsageSummary, PromptPayload, RlmError, RlmResult, UsageSummary};
use serde::{Deserialize, Serialize};

use crate::retry::{is_transient_status, retry_transient, RetryPolicy};
use crate::trait_def::{Backend, UsageTracker};

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

/// Adapter to a locally hosted direct-provider endpoint (Ollama and
/// Ollama-API-compatible servers). Unlike [`crate::http_proxy::OpenAiCompatBackend`]
/// this speaks a single-prompt generate API, not a chat-message array.
pub struct DirectBackend {
    client: Client,
    base_url: String,
    model_name: String,
    retry_policy: RetryPolicy,
    tracker: UsageTracker,
}

impl DirectBackend {
    pub fn new(base_url: impl Into<String>, model_name: impl Into<String>) -> RlmResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| RlmError::configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            model_name: model_name.into(),
            retry_policy: RetryPolicy::default(),
            tracker: UsageTracker::new(),
        })
    }

    async fn call_once(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
        let request = GenerateRequest {
            model: self.model_name.clone(),
            prompt: prompt.as_text(),
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| RlmError::backend(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_transient_status(status) {
                return Err(RlmError::backend(format!("transient http {status}: {body}")));
            }
            return Err(RlmError::backend(format!("http {status}: {body}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RlmError::protocol(format!("invalid json response: {e}")))?;

        let usage =
            ModelUsageSummary::single_call(parsed.prompt_eval_count, parsed.eval_count);
        Ok((parsed.response, usage))
    }
}

#[async_trait]
impl Backend for DirectBackend {
    async fn complete(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
        let result = retry_transient(
            &self.retry_policy,
            || self.call_once(prompt),
            |err| matches!(err, RlmError::Backend(msg) if msg.starts_with("transient")),
        )
        .await?;
        self.tracker.record(result.1);
        Ok(result)
    }

    fn last_usage(&self) -> ModelUsageSummary {
        self.tracker.last()
    }

    fn usage_summary(&self) -> UsageSummary {
        UsageSummary::single(self.model_name.clone(), self.tracker.cumulative())
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn completes_successfully_against_mock_server() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200).json_body(serde_json::json!({
                "response": "hi there",
                "prompt_eval_count": 4,
                "eval_count": 2
            }));
        });

        let backend = DirectBackend::new(server.base_url(), "llama3").unwrap();
        let (response, usage) = backend
            .complete(&PromptPayload::Text("hello".to_string()))
            .await
            .unwrap();

        assert_eq!(response, "hi there");
        assert_eq!(usage.total_input_tokens, 4);
        assert_eq!(usage.total_output_tokens, 2);
        mock.assert();
    }

    #[tokio::test]
    async fn missing_usage_counts_as_zero_not_a_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200).json_body(serde_json::json!({"response": "ok"}));
        });

        let backend = DirectBackend::new(server.base_url(), "llama3").unwrap();
        let (_, usage) = backend
            .complete(&PromptPayload::Text("hello".to_string()))
            .await
            .unwrap();
        assert_eq!(usage.total_input_tokens, 0);
        assert_eq!(usage.total_output_tokens, 0);
    }
}
