//! # rlm-core
//!
//! Shared data model, error taxonomy, configuration, and code-fence parsing
//! for the Recursive Language Model (RLM) runtime.
//!
//! An RLM lets a root language model solve a task by iteratively emitting
//! code into a sandboxed REPL, whose code can itself call sub-LMs to
//! arbitrary configured depth. This crate is the foundation every other
//! crate in the workspace depends on:
//!
//! - [`types`] — `ModelUsageSummary`, `UsageSummary`, `ReplResult`,
//!   `CodeBlock`, `RlmIteration`, `ChatCompletion`, `QueryMetadata`.
//! - [`error`] — the unified `RlmError` taxonomy (`spec.md` §7).
//! - [`config`] — `RlmConfig`, the per-RLM-construction options (`spec.md` §6).
//! - [`parsing`] — the deterministic `repl`-fence extractor and
//!   FINAL/FINAL_VAR marker scanner used by the Iteration Driver.
//! - [`logging`] — the `RlmLogger` observability trait.

pub mod config;
pub mod error;
pub mod logging;
pub mod parsing;
pub mod types;

pub use config::{BackendSpec, RlmConfig};
pub use error::{RlmError, RlmResult};
pub use logging::{default_logger, RlmLogger, TracingLogger};
pub use parsing::{extract_repl_blocks, find_final_marker, FinalMarker};
pub use types::{
    ChatCompletion, ChatMessage, CodeBlock, ModelUsageSummary, PromptPayload, QueryMetadata,
    ReplResult, Role, RlmIteration, RlmMetadata, UsageSummary,
};
