//! # rlm-environment
//!
//! The sandboxed REPL Environment abstraction (`spec.md` §4.3): a code
//! executor with a persistent namespace that exposes `llm_query`,
//! `llm_query_batched`, and `FINAL_VAR` to executing code, and talks to the
//! LM Router over [`rlm_router::client::RouterClient`].
//!
//! - [`environment`] — the shared [`environment::Environment`] trait and
//!   alias bookkeeping every variant reuses.
//! - [`in_process`] — [`in_process::InProcessEnvironment`], a `rhai`-backed
//!   sandbox running in the same address space.
//! - [`subprocess`] — [`subprocess::SubprocessEnvironment`], one `python3`
//!   child process per call with state persisted to a workspace file.
//! - [`container`] — [`container::ContainerEnvironment`], `docker exec`
//!   against a long-lived container.
//! - [`remote`] — [`remote::RemoteEnvironment`], HTTP RPC to a managed
//!   remote sandbox.
//!
//! All four variants implement the identical [`environment::Environment`]
//! contract; they differ only in *where* the code runs, per `spec.md` §4.3.

pub mod container;
pub mod environment;
pub mod in_process;
pub mod python_driver;
pub mod remote;
pub mod subprocess;

pub use environment::{AliasBookkeeping, Environment};
pub use container::ContainerEnvironment;
pub use in_process::InProcessEnvironment;
pub use remote::RemoteEnvironment;
pub use subprocess::SubprocessEnvironment;
