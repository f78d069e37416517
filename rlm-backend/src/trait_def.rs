//! The `Backend` trait: adapter to one LM provider.
//!
//! Grounded on `spec.md` §4.1's contract and on the capability-set shape
//! `kowalski-core`'s provider clients (`OpenRouterClient`, etc.) already
//! follow: a synchronous/async completion call plus usage accounting.

use std::sync::Mutex;

use async_trait::async_trait;
use rlm_core::{ChatMessage, ModelUsageSummary, PromptPayload, RlmResult, UsageSummary};

/// Adapter to a single LM provider. Implementors MUST be thread-safe: a
/// Backend is created once per RLM construction and lives for the RLM's
/// lifetime, serving concurrent calls from the Router's worker tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Synchronous completion. `prompt` is either a single string or an
    /// ordered sequence of role-tagged messages.
    async fn complete(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)>;

    /// Identical contract to `complete`, kept as a separate method so
    /// implementations that have a genuinely different async code path
    /// (e.g. a streaming HTTP client) are not forced to fake synchrony.
    /// The default forwards to `complete`.
    async fn complete_async(
        &self,
        prompt: &PromptPayload,
    ) -> RlmResult<(String, ModelUsageSummary)> {
        self.complete(prompt).await
    }

    /// Usage of the most recent call.
    fn last_usage(&self) -> ModelUsageSummary;

    /// Cumulative usage across every call this Backend has served.
    fn usage_summary(&self) -> UsageSummary;

    /// The provider-facing model name, used as the key in `UsageSummary`.
    fn model_name(&self) -> String;
}

/// Shared usage-tracking state every concrete Backend embeds, guarded by a
/// mutex per `spec.md` §5's "per-model usage counters: guarded by a mutex
/// inside each Backend."
#[derive(Debug, Default)]
pub struct UsageTracker {
    last: Mutex<ModelUsageSummary>,
    cumulative: Mutex<ModelUsageSummary>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: ModelUsageSummary) {
        *self.last.lock().unwrap() = usage;
        let mut cumulative = self.cumulative.lock().unwrap();
        *cumulative = cumulative.combine(&usage);
    }

    pub fn last(&self) -> ModelUsageSummary {
        *self.last.lock().unwrap()
    }

    pub fn cumulative(&self) -> ModelUsageSummary {
        *self.cumulative.lock().unwrap()
    }
}

/// Normalizes a `PromptPayload` into the messages a provider API expects,
/// folding a leading `system` message into the first `user` message when
/// the provider distinguishes no such role, per `spec.md` §4.1's contract.
pub fn normalize_messages(prompt: &PromptPayload, provider_has_system_role: bool) -> Vec<ChatMessage> {
    match prompt {
        PromptPayload::Text(text) => vec![ChatMessage::user(text.clone())],
        PromptPayload::Messages(messages) => {
            if provider_has_system_role {
                return messages.clone();
            }
            let mut system_prefix = String::new();
            let mut rest = Vec::new();
            for message in messages {
                if matches!(message.role, rlm_core::Role::System) && rest.is_empty() {
                    if !system_prefix.is_empty() {
                        system_prefix.push('\n');
                    }
                    system_prefix.push_str(&message.content);
                } else {
                    rest.push(message.clone());
                }
            }
            if !system_prefix.is_empty() {
                if let Some(first) = rest.first_mut() {
                    first.content = format!("{system_prefix}\n\n{}", first.content);
                } else {
                    rest.push(ChatMessage::user(system_prefix));
                }
            }
            rest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_tracker_accumulates() {
        let tracker = UsageTracker::new();
        tracker.record(ModelUsageSummary::single_call(10, 5));
        tracker.record(ModelUsageSummary::single_call(3, 2));
        assert_eq!(tracker.cumulative().total_calls, 2);
        assert_eq!(tracker.last().total_calls, 1);
    }

    #[test]
    fn normalize_folds_system_into_first_user_message_when_unsupported() {
        let prompt = PromptPayload::Messages(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
        ]);
        let normalized = normalize_messages(&prompt, false);
        assert_eq!(normalized.len(), 1);
        assert!(normalized[0].content.contains("be terse"));
        assert!(normalized[0].content.contains("hello"));
    }

    #[test]
    fn normalize_keeps_system_role_when_supported() {
        let prompt = PromptPayload::Messages(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
        ]);
        let normalized = normalize_messages(&prompt, true);
        assert_eq!(normalized.len(), 2);
    }
}
