//! The Recursive Client (`spec.md` §4.5): a Backend-shaped adapter that, in
//! place of calling a provider, spawns a full nested Iteration Driver at
//! depth *d+1*.
//!
//! Grounded on `original_source/rlm/core/rlm.py`'s depth handling and
//! `kowalski-federation/src/depth_controller.rs`'s per-depth backend
//! selection shape. [`crate::rlm::Rlm`] decides, per `spec.md` §4.5's "At
//! the configured maximum depth it degrades to a direct call", whether to
//! register one of these or a plain Backend as the Router's depth-1 "other
//! backend" — this type itself always recurses.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use rlm_backend::Backend;
use rlm_core::{ModelUsageSummary, PromptPayload, RlmConfig, RlmError, RlmResult, UsageSummary};

use crate::rlm::Rlm;

/// Per-call/cumulative usage of every nested completion this client has
/// run, plus the nested Router's last-observed per-depth call counts
/// (`spec.md` §4.2's "Recursive clients aggregate their nested depth
/// counts into the parent when queried").
#[derive(Default)]
struct NestedTracker {
    last: UsageSummary,
    cumulative: UsageSummary,
    last_depth_calls: std::collections::HashMap<u32, u64>,
}

/// A Backend whose `complete` builds a fresh [`Rlm`] at depth *d+1* (the
/// `nested_config` this client was constructed with already has its
/// `max_depth`/`max_iterations` adjusted per `spec.md` §4.5) and runs it to
/// completion, returning the nested run's final answer as if it were a
/// direct LM response.
pub struct RecursiveBackend {
    nested_config: RlmConfig,
    tracker: StdMutex<NestedTracker>,
}

impl RecursiveBackend {
    pub fn new(nested_config: RlmConfig) -> Self {
        Self { nested_config, tracker: StdMutex::new(NestedTracker::default()) }
    }

    /// The nested Router's per-depth call counts from the most recent
    /// completion, shifted up by one level so they compose into the
    /// parent's own depth accounting.
    pub fn nested_depth_calls(&self) -> std::collections::HashMap<u32, u64> {
        self.tracker
            .lock()
            .unwrap()
            .last_depth_calls
            .iter()
            .map(|(depth, calls)| (depth + 1, *calls))
            .collect()
    }
}

#[async_trait]
impl Backend for RecursiveBackend {
    async fn complete(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
        let rlm = Rlm::from_config(self.nested_config.clone())
            .map_err(|e| RlmError::internal(format!("failed to construct nested rlm: {e}")))?;
        let completion = rlm.completion(prompt.as_text()).await?;
        let depth_calls = rlm.last_depth_call_counts().await;

        let mut tracker = self.tracker.lock().unwrap();
        tracker.last = completion.usage_summary.clone();
        tracker.cumulative.merge(&completion.usage_summary);
        tracker.last_depth_calls = depth_calls;

        let total: ModelUsageSummary = tracker
            .last
            .model_usage_summaries
            .values()
            .fold(ModelUsageSummary::default(), |acc, usage| acc.combine(usage));
        Ok((completion.response, total))
    }

    fn last_usage(&self) -> ModelUsageSummary {
        self.tracker
            .lock()
            .unwrap()
            .last
            .model_usage_summaries
            .values()
            .fold(ModelUsageSummary::default(), |acc, usage| acc.combine(usage))
    }

    fn usage_summary(&self) -> UsageSummary {
        self.tracker.lock().unwrap().cumulative.clone()
    }

    fn model_name(&self) -> String {
        format!("recursive({})", self.nested_config.backend.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_core::BackendSpec;
    use serde_json::json;

    fn mock_backend_spec(server_url: &str) -> BackendSpec {
        BackendSpec::new("direct")
            .with_kwarg("base_url", json!(server_url))
            .with_kwarg("model_name", json!("nested-model"))
    }

    #[tokio::test]
    async fn recursing_once_runs_a_nested_completion_and_aggregates_usage() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/api/generate");
            then.status(200).json_body(json!({
                "response": "FINAL(nested answer)",
                "prompt_eval_count": 3,
                "eval_count": 2
            }));
        });

        let nested_config = RlmConfig::new(mock_backend_spec(&server.base_url()))
            .with_max_depth(0)
            .with_max_iterations(1);
        let client = RecursiveBackend::new(nested_config);

        let (response, usage) = client.complete(&PromptPayload::Text("solve it".to_string())).await.unwrap();
        assert_eq!(response, "FINAL(nested answer)");
        assert_eq!(usage.total_calls, 1);
        assert_eq!(client.usage_summary().model_usage_summaries.len(), 1);
    }
}
