//! The LM Router: a concurrent multi-client server that lets code running
//! inside a sandboxed REPL make LM calls without embedding provider
//! credentials or SDKs in the sandbox.
//!
//! Grounded on `original_source/rlm/core/lm_handler.py` for the routing
//! algorithm and depth-call accounting, re-expressed as the async-server
//! idiom `spec.md` §9 Design Notes calls out for Rust: a
//! `tokio::net::TcpListener` with one spawned task per connection, rather
//! than the original's socket-server-in-a-thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rlm_backend::Backend;
use rlm_core::{ChatCompletion, PromptPayload, RlmError, RlmResult, UsageSummary};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, RwLock};

use crate::protocol::{read_framed, write_framed, RouterRequest, RouterResponse, DEFAULT_TIMEOUT};

/// Concurrent multiplexer from REPL-issued LM requests to registered
/// Backends, selecting one by the routing algorithm in `spec.md` §4.2.
pub struct LmRouter {
    by_model: RwLock<HashMap<String, Arc<dyn Backend>>>,
    by_depth: RwLock<HashMap<u32, Arc<dyn Backend>>>,
    other_backend: RwLock<Option<Arc<dyn Backend>>>,
    default_backend: Arc<dyn Backend>,
    depth_calls: std::sync::Mutex<HashMap<u32, u64>>,
}

impl LmRouter {
    pub fn new(default_backend: Arc<dyn Backend>) -> Self {
        Self {
            by_model: RwLock::new(HashMap::new()),
            by_depth: RwLock::new(HashMap::new()),
            other_backend: RwLock::new(None),
            default_backend,
            depth_calls: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_by_model(&self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        self.by_model.write().await.insert(name.into(), backend);
    }

    pub async fn register_by_depth(&self, depth: u32, backend: Arc<dyn Backend>) {
        self.by_depth.write().await.insert(depth, backend);
    }

    /// Sets the "other backend" used at depth 1 when no model- or
    /// depth-specific route matches (`spec.md` §4.2 routing step 3).
    pub async fn set_other_backend(&self, backend: Arc<dyn Backend>) {
        *self.other_backend.write().await = Some(backend);
    }

    /// Snapshot of per-depth served-call counts, aggregated for recursive
    /// clients querying their parent Router (`spec.md` §4.2's
    /// "Depth-call accounting").
    pub fn depth_call_counts(&self) -> HashMap<u32, u64> {
        self.depth_calls.lock().unwrap().clone()
    }

    fn record_depth_calls(&self, depth: u32, n: u64) {
        let mut calls = self.depth_calls.lock().unwrap();
        *calls.entry(depth).or_insert(0) += n;
    }

    /// Applies the routing algorithm in `spec.md` §4.2, in order:
    /// 1. named `model` registered → that Backend.
    /// 2. a Backend registered for `depth` → that Backend.
    /// 3. `depth == 1` and an "other backend" is configured → that Backend.
    /// 4. the default Backend (last resort; routing is total).
    pub async fn route(&self, model: Option<&str>, depth: u32) -> Arc<dyn Backend> {
        if let Some(name) = model {
            if !name.is_empty() {
                if let Some(backend) = self.by_model.read().await.get(name) {
                    return backend.clone();
                }
            }
        }
        if let Some(backend) = self.by_depth.read().await.get(&depth) {
            return backend.clone();
        }
        if depth == 1 {
            if let Some(backend) = self.other_backend.read().await.as_ref() {
                return backend.clone();
            }
        }
        self.default_backend.clone()
    }

    /// The core RPC: routes and executes a single or batched completion
    /// request, recording depth-call accounting.
    pub async fn handle(&self, request: RouterRequest) -> RouterResponse {
        if request.is_batched() {
            let prompts = request.prompts.unwrap_or_default();
            if prompts.is_empty() {
                return RouterResponse::batched_ok(Vec::new());
            }
            self.record_depth_calls(request.depth, prompts.len() as u64);
            let backend = self.route(request.model.as_deref(), request.depth).await;
            let futures = prompts.into_iter().map(|prompt| {
                let backend = backend.clone();
                async move { complete_one(backend, PromptPayload::Text(prompt)).await }
            });
            let completions = futures::future::join_all(futures).await;
            RouterResponse::batched_ok(completions)
        } else {
            let Some(prompt) = request.prompt else {
                return RouterResponse::failed("request carries neither prompt nor prompts");
            };
            self.record_depth_calls(request.depth, 1);
            let backend = self.route(request.model.as_deref(), request.depth).await;
            let completion = complete_one(backend, PromptPayload::Text(prompt)).await;
            RouterResponse::single_ok(completion)
        }
    }

    /// Binds a TCP listener at `addr` (`0.0.0.0:0` for an ephemeral port)
    /// and spawns the accept loop on the current Tokio runtime. Returns the
    /// bound address and a handle whose `shutdown()` stops the server.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> RlmResult<(SocketAddr, RouterHandle)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RlmError::router_transport(format!("failed to bind {addr}: {e}")))?;
        let bound_addr = listener
            .local_addr()
            .map_err(|e| RlmError::router_transport(e.to_string()))?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let router = self.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _peer)) => {
                                let router = router.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = router.serve_connection(stream).await {
                                        tracing::debug!(error = %err, "router connection ended");
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "router accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok((bound_addr, RouterHandle { shutdown_tx: Some(shutdown_tx), join }))
    }

    /// Serves requests on one already-accepted connection until the peer
    /// closes it. A framing error on one connection is logged and dropped;
    /// it never crashes the server (`spec.md` §7's Router transport row).
    async fn serve_connection(&self, mut stream: TcpStream) -> RlmResult<()> {
        loop {
            let request: Option<RouterRequest> = read_framed(&mut stream).await?;
            let Some(request) = request else {
                return Ok(());
            };
            let response = match tokio::time::timeout(DEFAULT_TIMEOUT, self.handle(request)).await
            {
                Ok(response) => response,
                Err(_) => RouterResponse::failed("router request timed out"),
            };
            write_framed(&mut stream, &response).await?;
        }
    }
}

async fn complete_one(backend: Arc<dyn Backend>, prompt: PromptPayload) -> ChatCompletion {
    let start = Instant::now();
    match backend.complete_async(&prompt).await {
        Ok((response, usage)) => ChatCompletion::success(
            backend.model_name(),
            prompt,
            response,
            UsageSummary::single(backend.model_name(), usage),
            start.elapsed(),
        ),
        Err(err) => ChatCompletion {
            root_model: backend.model_name(),
            prompt,
            response: err.as_repl_sentinel(),
            usage_summary: UsageSummary::default(),
            execution_time: start.elapsed(),
            error: Some(err.to_string()),
            error_type: Some(error_type_of(&err)),
            status_code: None,
        },
    }
}

fn error_type_of(err: &RlmError) -> String {
    match err {
        RlmError::Backend(_) => "permanent_provider".to_string(),
        RlmError::BackendTransientExhausted(_) => "transient_provider_exhausted".to_string(),
        RlmError::Protocol(_) => "protocol".to_string(),
        _ => "backend".to_string(),
    }
}

/// Handle to a running [`LmRouter`] server. Dropping it without calling
/// [`shutdown`](RouterHandle::shutdown) leaves the accept loop running;
/// `spec.md` §3 expects the Router to be "stopped after the last
/// iteration" in non-persistent mode, so callers should shut it down
/// explicitly when the completion finishes.
pub struct RouterHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl RouterHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rlm_core::ModelUsageSummary;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct EchoBackend {
        name: String,
        calls: AtomicU64,
    }

    impl EchoBackend {
        fn new(name: &str) -> Self {
            Self { name: name.to_string(), calls: AtomicU64::new(0) }
        }
    }

    #[async_trait]
    impl Backend for EchoBackend {
        async fn complete(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((prompt.as_text().to_uppercase(), ModelUsageSummary::single_call(1, 1)))
        }

        fn last_usage(&self) -> ModelUsageSummary {
            ModelUsageSummary::single_call(1, 1)
        }

        fn usage_summary(&self) -> UsageSummary {
            UsageSummary::single(self.name.clone(), ModelUsageSummary::single_call(1, 1))
        }

        fn model_name(&self) -> String {
            self.name.clone()
        }
    }

    #[tokio::test]
    async fn routes_by_model_name_first() {
        let router = LmRouter::new(Arc::new(EchoBackend::new("default")));
        router.register_by_model("special", Arc::new(EchoBackend::new("special"))).await;
        let backend = router.route(Some("special"), 0).await;
        assert_eq!(backend.model_name(), "special");
    }

    #[tokio::test]
    async fn falls_back_to_depth_then_other_then_default() {
        let router = LmRouter::new(Arc::new(EchoBackend::new("default")));
        router.register_by_depth(2, Arc::new(EchoBackend::new("depth2"))).await;
        router.set_other_backend(Arc::new(EchoBackend::new("other"))).await;

        assert_eq!(router.route(None, 2).await.model_name(), "depth2");
        assert_eq!(router.route(None, 1).await.model_name(), "other");
        assert_eq!(router.route(None, 3).await.model_name(), "default");
    }

    #[tokio::test]
    async fn handle_single_request_increments_depth_calls() {
        let router = LmRouter::new(Arc::new(EchoBackend::new("default")));
        let response = router.handle(RouterRequest::single("hi", None, 0)).await;
        assert!(response.success);
        assert_eq!(response.chat_completion.unwrap().response, "HI");
        assert_eq!(router.depth_call_counts().get(&0), Some(&1));
    }

    #[tokio::test]
    async fn handle_batched_request_preserves_order() {
        let router = LmRouter::new(Arc::new(EchoBackend::new("default")));
        let response = router
            .handle(RouterRequest::batched(
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                None,
                1,
            ))
            .await;
        let completions = response.chat_completions.unwrap();
        assert_eq!(completions.len(), 3);
        assert_eq!(completions[0].response, "A");
        assert_eq!(completions[1].response, "B");
        assert_eq!(completions[2].response, "C");
        assert_eq!(router.depth_call_counts().get(&1), Some(&3));
    }

    #[tokio::test]
    async fn handle_empty_batch_is_a_noop() {
        let router = LmRouter::new(Arc::new(EchoBackend::new("default")));
        let response = router.handle(RouterRequest::batched(vec![], None, 1)).await;
        assert_eq!(response.chat_completions.unwrap().len(), 0);
        assert!(router.depth_call_counts().is_empty());
    }

    #[tokio::test]
    async fn serves_requests_over_a_real_tcp_connection() {
        let router = Arc::new(LmRouter::new(Arc::new(EchoBackend::new("default"))));
        let (addr, handle) = router.clone().serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_framed(&mut stream, &RouterRequest::single("ping", None, 0)).await.unwrap();
        let response: RouterResponse = read_framed(&mut stream).await.unwrap().unwrap();
        assert!(response.success);
        assert_eq!(response.chat_completion.unwrap().response, "PING");

        drop(stream);
        handle.shutdown().await;
    }
}
