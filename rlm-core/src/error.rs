//! Unified error taxonomy for the RLM runtime.
//!
//! Grounded on `kowalski-rlm/src/error.rs`'s `thiserror` enum + lowercase
//! constructor pattern. Variants map 1:1 onto the error taxonomy table in
//! `spec.md` §7, plus the three user-visible failure types its last
//! paragraph names (`ConfigurationError`, `EnvironmentError`, `BudgetError`)
//! as dedicated variants rather than ad-hoc strings.

use thiserror::Error;

pub type RlmResult<T> = Result<T, RlmError>;

#[derive(Debug, Error)]
pub enum RlmError {
    /// Configuration error (unknown backend, incompatible persistence).
    /// Raised immediately at construction; no RLM instance is produced.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// REPL fatal error (sandbox crashed / unreachable). Completion aborts.
    #[error("environment error: {0}")]
    Environment(String),

    /// Budget exhaustion configured to be fatal rather than best-effort.
    #[error("budget exhausted: {0}")]
    Budget(String),

    /// Router transport error (connection closed, framing error). Dropped
    /// for the specific connection; does not crash the server.
    #[error("router transport error: {0}")]
    RouterTransport(String),

    /// Permanent-provider error (auth, bad request). Surfaced to the Router
    /// as a failed response.
    #[error("backend error: {0}")]
    Backend(String),

    /// Transient-provider error that exhausted its retry budget.
    #[error("backend error (after retries): {0}")]
    BackendTransientExhausted(String),

    /// Wire-protocol framing/serialization error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Depth/recursion-policy violation (e.g. negative depth).
    #[error("depth error: {0}")]
    Depth(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RlmError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment(msg.into())
    }

    pub fn budget(msg: impl Into<String>) -> Self {
        Self::Budget(msg.into())
    }

    pub fn router_transport(msg: impl Into<String>) -> Self {
        Self::RouterTransport(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn backend_transient_exhausted(msg: impl Into<String>) -> Self {
        Self::BackendTransientExhausted(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn depth(msg: impl Into<String>) -> Self {
        Self::Depth(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The `[error]`-sentinel string the Environment/Driver thread back into
    /// the REPL so the model can observe and react to it, per the
    /// propagation policy in `spec.md` §7: provider/router errors are
    /// reified as data, not raised across the REPL boundary.
    pub fn as_repl_sentinel(&self) -> String {
        format!("[error] {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repl_sentinel_is_prefixed() {
        let err = RlmError::backend("rate limited");
        assert!(err.as_repl_sentinel().starts_with("[error]"));
    }

    #[test]
    fn constructors_build_expected_variants() {
        assert!(matches!(RlmError::configuration("x"), RlmError::Configuration(_)));
        assert!(matches!(RlmError::budget("x"), RlmError::Budget(_)));
        assert!(matches!(RlmError::depth("x"), RlmError::Depth(_)));
    }
}
