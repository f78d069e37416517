//! # rlm-router
//!
//! The LM Router (`spec.md` §4.2): a concurrent server that receives
//! completion requests from REPL processes and routes each to an
//! appropriate [`rlm_backend::Backend`] by depth/model policy, tracking
//! per-depth call counts.
//!
//! - [`protocol`] — the length-prefixed JSON wire format.
//! - [`server`] — [`server::LmRouter`], the threaded/async TCP server.
//! - [`client`] — [`client::RouterClient`], used by Environments to reach it.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RouterClient;
pub use protocol::{RouterRequest, RouterResponse};
pub use server::{LmRouter, RouterHandle};
