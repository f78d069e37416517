//! Observability sink for the Iteration Driver.
//!
//! `spec.md` §6 names `verbose`/`logger` as configuration options but
//! explicitly treats them as out of the core contract. The ambient-stack
//! requirement still applies: this crate carries a small trait so the
//! driver can emit structured events the way `kowalski-core`'s agents do
//! with `tracing`, rather than printing ad hoc strings.

use std::sync::Arc;

use crate::types::{RlmIteration, RlmMetadata};

/// Sink for RLM run metadata and per-iteration records.
pub trait RlmLogger: Send + Sync {
    fn log_metadata(&self, metadata: &RlmMetadata);
    fn log_iteration(&self, iteration: &RlmIteration, iteration_index: u32);
}

/// Default logger: emits `tracing` events. Installed by default so every
/// run is observable via `RUST_LOG` without requiring a custom sink.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl RlmLogger for TracingLogger {
    fn log_metadata(&self, metadata: &RlmMetadata) {
        tracing::info!(
            root_model = %metadata.root_model,
            max_depth = metadata.max_depth,
            max_iterations = metadata.max_iterations,
            backend = %metadata.backend,
            environment_type = %metadata.environment_type,
            "rlm run starting"
        );
    }

    fn log_iteration(&self, iteration: &RlmIteration, iteration_index: u32) {
        tracing::debug!(
            iteration_index,
            code_blocks = iteration.code_blocks.len(),
            terminal = iteration.is_terminal(),
            "rlm iteration complete"
        );
    }
}

pub fn default_logger() -> Arc<dyn RlmLogger> {
    Arc::new(TracingLogger)
}
