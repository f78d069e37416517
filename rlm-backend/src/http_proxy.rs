//! OpenAI-compatible HTTP proxy Backend.
//!
//! Grounded directly on `kowalski-core/src/providers/openrouter.rs`: same
//! `reqwest::ClientBuilder` pooling/timeout conventions, same
//! Bearer-auth + `/chat/completions` request shape, generalized to any
//! base URL (OpenRouter, a local vLLM/Ollama OpenAI-compat endpoint, etc.)
//! per `spec.md` §4.1's "OpenAI-compatible HTTP proxy (constructed with a
//! base URL)" Backend variant.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use rlm_core::{ModelUsageSummary, PromptPayload, RlmError, RlmResult, UsageSummary};
use serde::{Deserialize, Serialize};

use crate::retry::{is_transient_status, retry_transient, RetryPolicy};
use crate::trait_def::{normalize_messages, Backend, UsageTracker};

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageField>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageField {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct OpenAiCompatBackend {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model_name: String,
    retry_policy: RetryPolicy,
    tracker: UsageTracker,
}

impl OpenAiCompatBackend {
    pub fn new(base_url: impl Into<String>, model_name: impl Into<String>, api_key: Option<String>) -> RlmResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| RlmError::configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
            model_name: model_name.into(),
            retry_policy: RetryPolicy::default(),
            tracker: UsageTracker::new(),
        })
    }

    async fn call_once(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
        let messages = normalize_messages(prompt, true)
            .into_iter()
            .map(|m| WireMessage { role: m.role.to_string(), content: m.content })
            .collect();

        let request = ChatRequest {
            model: self.model_name.clone(),
            messages,
            temperature: None,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
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

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RlmError::protocol(format!("invalid json response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RlmError::backend("no choices in response"))?;

        let usage = parsed
            .usage
            .map(|u| ModelUsageSummary::single_call(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| ModelUsageSummary::single_call(0, 0));

        Ok((content, usage))
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    async fn complete(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
        let _start = Instant::now();
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
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content": "hello there"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 3}
            }));
        });

        let backend = OpenAiCompatBackend::new(server.base_url(), "test-model", None).unwrap();
        let (response, usage) = backend
            .complete(&PromptPayload::Text("hi".to_string()))
            .await
            .unwrap();

        assert_eq!(response, "hello there");
        assert_eq!(usage.total_input_tokens, 10);
        assert_eq!(usage.total_output_tokens, 3);
        mock.assert();
    }

    #[tokio::test]
    async fn surfaces_permanent_errors_without_retry() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body("unauthorized");
        });

        let backend = OpenAiCompatBackend::new(server.base_url(), "test-model", None).unwrap();
        let result = backend.complete(&PromptPayload::Text("hi".to_string())).await;
        assert!(result.is_err());
        mock.assert_hits(1);
    }
}
