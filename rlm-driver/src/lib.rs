//! # rlm-driver
//!
//! The Iteration Driver (`spec.md` §4.4), the Recursive Client (`spec.md`
//! §4.5), and the public `Rlm`/`RlmSession`/`RlmBuilder` entry points that
//! tie every other crate in this workspace together into one `completion()`
//! call.
//!
//! - [`prompts`] — the fixed system-prompt templates and per-iteration
//!   nudges, grounded on `original_source/rlm/utils/prompts.py`.
//! - [`backend_factory`] / [`environment_factory`] — construct a concrete
//!   [`rlm_backend::Backend`] / [`rlm_environment::Environment`] from a
//!   [`rlm_core::BackendSpec`] / `RlmConfig`'s environment fields.
//! - [`iteration`] — the INIT/PROMPTING/EXECUTING/CHECK_TERMINAL/DONE state
//!   machine, grounded on `original_source/rlm/core/rlm.py`.
//! - [`recursive`] — [`recursive::RecursiveBackend`], a Backend that spawns a
//!   nested [`Rlm`] at depth *d+1*.
//! - [`rlm`] — [`Rlm`], [`RlmSession`], and [`RlmBuilder`], the public API,
//!   grounded on `kowalski-rlm/src/builder.rs`.

pub mod backend_factory;
pub mod environment_factory;
pub mod iteration;
pub mod prompts;
pub mod recursive;
pub mod rlm;

pub use recursive::RecursiveBackend;
pub use rlm::{Rlm, RlmBuilder, RlmSession};
