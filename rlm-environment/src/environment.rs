//! The `Environment` trait: a sandboxed code executor with a persistent
//! namespace, shared by every variant in this crate.
//!
//! Grounded on `spec.md` §4.3: "Variants differ only in *where* the code
//! runs... the contract is identical." Every variant wraps its `execute`
//! body in the same per-Environment mutex (`spec.md` §5's "Concurrent
//! `execute` calls on the same Environment are serialized") and exposes the
//! same context/history bookkeeping operations.

use std::net::SocketAddr;

use async_trait::async_trait;
use rlm_core::{ChatMessage, ReplResult, RlmResult};

/// Sandboxed executor with a persistent namespace. `spec.md` §4.3 lists
/// four variants (in-process, subprocess-per-call, container-per-RLM,
/// remote-sandbox) that all implement this identical contract.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Executes `code` against the persistent namespace. Concurrent calls
    /// on the same Environment are serialized internally.
    async fn execute(&self, code: &str) -> RlmResult<ReplResult>;

    /// Rebinds the address of the LM Router this Environment's injected
    /// `llm_query`/`llm_query_batched` talk to. Used when a persistent
    /// Environment is reused across `completion()` calls, each of which
    /// spawns its own Router.
    async fn update_router_address(&self, addr: SocketAddr);

    /// Adds a versioned session context (`session_context_i`), or the
    /// sole non-session `context` when `idx` is `None`. Returns the index
    /// assigned.
    async fn add_context(&self, payload: serde_json::Value, idx: Option<usize>) -> RlmResult<usize>;

    async fn get_context_count(&self) -> usize;

    /// Adds a prior turn's message history (`session_history`, session
    /// mode only). Returns the index assigned.
    async fn add_history(&self, messages: Vec<ChatMessage>, idx: Option<usize>) -> RlmResult<usize>;

    async fn get_history_count(&self) -> usize;

    /// Sets `completion_context`, the non-session-mode per-completion
    /// binding refreshed each call.
    async fn set_completion_context(&self, payload: serde_json::Value);

    /// Releases any resources (temp directories, containers, remote
    /// sessions) this Environment instance owns.
    async fn cleanup(&self) -> RlmResult<()>;

    /// Resolves a `FINAL_VAR(name)` marker against the current namespace.
    /// Per `spec.md` §4.3's `FINAL_VAR` semantics: if `name` is bound,
    /// returns its stringified value; otherwise returns a diagnostic
    /// string listing the available bindings — never an error, so the
    /// Iteration Driver can feed the diagnostic back to the model and keep
    /// iterating.
    async fn final_var(&self, name: &str) -> String;
}

/// Bookkeeping shared by every variant: the ordered list of bound
/// contexts/histories and which index `context`/`history` currently alias.
/// `spec.md` §3's namespace-monotonicity invariant ("reserved names... are
/// never overwritten... aliases are restored after each execution") is
/// implemented by re-pointing these aliases, never by mutating the
/// numbered entries themselves.
#[derive(Debug, Default)]
pub struct AliasBookkeeping {
    pub context_count: usize,
    pub history_count: usize,
}

impl AliasBookkeeping {
    pub fn next_context_index(&mut self, requested: Option<usize>) -> usize {
        let idx = requested.unwrap_or(self.context_count);
        self.context_count = self.context_count.max(idx + 1);
        idx
    }

    pub fn next_history_index(&mut self, requested: Option<usize>) -> usize {
        let idx = requested.unwrap_or(self.history_count);
        self.history_count = self.history_count.max(idx + 1);
        idx
    }

    /// The index `context`/`history` should currently alias: the most
    /// recently added entry.
    pub fn current_context_alias(&self) -> Option<usize> {
        self.context_count.checked_sub(1)
    }

    pub fn current_history_alias(&self) -> Option<usize> {
        self.history_count.checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_adds_assign_increasing_indices() {
        let mut book = AliasBookkeeping::default();
        assert_eq!(book.next_context_index(None), 0);
        assert_eq!(book.next_context_index(None), 1);
        assert_eq!(book.current_context_alias(), Some(1));
    }

    #[test]
    fn explicit_index_does_not_regress_the_count() {
        let mut book = AliasBookkeeping::default();
        book.next_context_index(Some(3));
        assert_eq!(book.context_count, 4);
        assert_eq!(book.current_context_alias(), Some(3));
    }
}
