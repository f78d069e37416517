//! Data model shared by every RLM component: usage accounting, REPL
//! execution results, and the per-iteration/per-completion records.
//!
//! Grounded on `original_source/rlm/core/types.py`; field names are kept
//! close to the original dataclasses (translated to `snake_case` Rust
//! conventions) since they describe a wire-visible shape other components
//! serialize and deserialize.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-model call/token counters. A monoid under componentwise addition;
/// `ModelUsageSummary::default()` is the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsageSummary {
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl ModelUsageSummary {
    pub fn single_call(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            total_calls: 1,
            total_input_tokens: input_tokens,
            total_output_tokens: output_tokens,
        }
    }

    /// Componentwise addition, matching the Python source's manual
    /// reconstruction in `LMHandler.get_usage_summary`.
    pub fn combine(&self, other: &Self) -> Self {
        Self {
            total_calls: self.total_calls + other.total_calls,
            total_input_tokens: self.total_input_tokens + other.total_input_tokens,
            total_output_tokens: self.total_output_tokens + other.total_output_tokens,
        }
    }
}

/// Mapping from model name to its usage. Merges by summing corresponding
/// entries (see `merge`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub model_usage_summaries: BTreeMap<String, ModelUsageSummary>,
}

impl UsageSummary {
    pub fn single(model: impl Into<String>, usage: ModelUsageSummary) -> Self {
        let mut model_usage_summaries = BTreeMap::new();
        model_usage_summaries.insert(model.into(), usage);
        Self { model_usage_summaries }
    }

    /// Merge another summary into this one, summing overlapping model
    /// entries. Mirrors `LMHandler.get_usage_summary`'s `merge_summary`.
    pub fn merge(&mut self, other: &UsageSummary) {
        for (model, usage) in &other.model_usage_summaries {
            self.model_usage_summaries
                .entry(model.clone())
                .and_modify(|existing| *existing = existing.combine(usage))
                .or_insert(*usage);
        }
    }

    pub fn merged(mut self, other: &UsageSummary) -> Self {
        self.merge(other);
        self
    }
}

/// The unit of a single LM call anywhere in the system: root completion,
/// sub-LM call from a REPL, or a nested recursive completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub root_model: String,
    pub prompt: PromptPayload,
    pub response: String,
    pub usage_summary: UsageSummary,
    pub execution_time: Duration,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub status_code: Option<u16>,
}

impl ChatCompletion {
    pub fn success(
        root_model: impl Into<String>,
        prompt: PromptPayload,
        response: impl Into<String>,
        usage_summary: UsageSummary,
        execution_time: Duration,
    ) -> Self {
        Self {
            root_model: root_model.into(),
            prompt,
            response: response.into(),
            usage_summary,
            execution_time,
            error: None,
            error_type: None,
            status_code: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Either a single string prompt or an ordered sequence of role-tagged
/// messages, matching `spec.md` §4.1's `prompt` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPayload {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl PromptPayload {
    pub fn as_text(&self) -> String {
        match self {
            PromptPayload::Text(s) => s.clone(),
            PromptPayload::Messages(msgs) => msgs
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// All observable effects of executing one `repl` code block.
///
/// `locals_snapshot` is a shallow, truncated textual representation of
/// non-private namespace bindings (per `spec.md` §9 Design Notes: "truncate
/// the textual locals snapshot aggressively"); `llm_calls` is the ordered
/// list of sub-LM calls that code block produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplResult {
    pub stdout: String,
    pub stderr: String,
    pub locals_snapshot: BTreeMap<String, String>,
    pub execution_time: Duration,
    pub llm_calls: Vec<ChatCompletion>,
}

/// Maximum length, in bytes, of a single value's textual repr inside
/// `locals_snapshot` before truncation. Matches `spec.md` §9's "1-2 KB" cap.
pub const LOCALS_SNAPSHOT_VALUE_CAP: usize = 2048;

pub fn truncate_repr(value: &str) -> String {
    if value.len() <= LOCALS_SNAPSHOT_VALUE_CAP {
        value.to_string()
    } else {
        let mut truncated = value[..LOCALS_SNAPSHOT_VALUE_CAP].to_string();
        truncated.push_str("... (truncated)");
        truncated
    }
}

/// One `repl`-fenced snippet extracted from an LM response, paired with its
/// execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    pub result: ReplResult,
}

/// One round of model-then-execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmIteration {
    pub prompt: PromptPayload,
    pub response: String,
    pub code_blocks: Vec<CodeBlock>,
    pub final_answer: Option<String>,
    pub iteration_time: Option<Duration>,
}

impl RlmIteration {
    pub fn is_terminal(&self) -> bool {
        self.final_answer.is_some()
    }
}

/// Metadata about the shape of a prompt payload, surfaced to the root LM in
/// the INIT user message (§4.4) instead of the raw content.
///
/// Grounded on `original_source/rlm/core/types.py::QueryMetadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub context_lengths: Vec<usize>,
    pub context_total_length: usize,
    pub context_type: String,
}

impl QueryMetadata {
    pub fn from_text(text: &str) -> Self {
        Self {
            context_lengths: vec![text.len()],
            context_total_length: text.len(),
            context_type: "str".to_string(),
        }
    }

    pub fn from_chunks(chunks: &[String]) -> Self {
        let context_lengths: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        let context_total_length = context_lengths.iter().sum();
        Self {
            context_lengths,
            context_total_length,
            context_type: "list".to_string(),
        }
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let context_lengths: Vec<usize> = map.values().map(|v| v.len()).collect();
        let context_total_length = context_lengths.iter().sum();
        Self {
            context_lengths,
            context_total_length,
            context_type: "dict".to_string(),
        }
    }

    /// Maximum number of per-chunk lengths rendered verbatim before an
    /// "… N others" marker, per `spec.md` §4.4 INIT.
    pub const MAX_RENDERED_CHUNKS: usize = 100;

    pub fn render(&self) -> String {
        let total_chunks = self.context_lengths.len();
        let shown = &self.context_lengths[..total_chunks.min(Self::MAX_RENDERED_CHUNKS)];
        let mut rendered = format!(
            "type={}, total_length={}, chunk_lengths={:?}",
            self.context_type, self.context_total_length, shown
        );
        if total_chunks > Self::MAX_RENDERED_CHUNKS {
            rendered.push_str(&format!(
                " ... {} others",
                total_chunks - Self::MAX_RENDERED_CHUNKS
            ));
        }
        rendered
    }
}

/// Metadata about an RLM's configuration, surfaced to loggers/verbose sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmMetadata {
    pub root_model: String,
    pub max_depth: u32,
    pub max_iterations: u32,
    pub backend: String,
    pub environment_type: String,
    pub other_backends: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_summary_merges_overlapping_models() {
        let mut a = UsageSummary::single("gpt", ModelUsageSummary::single_call(10, 20));
        let b = UsageSummary::single("gpt", ModelUsageSummary::single_call(5, 7));
        a.merge(&b);
        let combined = a.model_usage_summaries.get("gpt").unwrap();
        assert_eq!(combined.total_calls, 2);
        assert_eq!(combined.total_input_tokens, 15);
        assert_eq!(combined.total_output_tokens, 27);
    }

    #[test]
    fn usage_summary_identity_is_zeros() {
        let zero = ModelUsageSummary::default();
        let five = ModelUsageSummary::single_call(5, 5);
        assert_eq!(zero.combine(&five), five);
    }

    #[test]
    fn query_metadata_truncates_long_chunk_lists() {
        let chunks: Vec<String> = (0..150).map(|i| "x".repeat(i)).collect();
        let metadata = QueryMetadata::from_chunks(&chunks);
        let rendered = metadata.render();
        assert!(rendered.contains("50 others"));
    }

    #[test]
    fn truncate_repr_caps_long_values() {
        let long = "a".repeat(5000);
        let truncated = truncate_repr(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.ends_with("(truncated)"));
    }

    #[test]
    fn prompt_payload_renders_messages_as_text() {
        let payload = PromptPayload::Messages(vec![
            ChatMessage::system("be nice"),
            ChatMessage::user("hello"),
        ]);
        let text = payload.as_text();
        assert!(text.contains("system: be nice"));
        assert!(text.contains("user: hello"));
    }
}
