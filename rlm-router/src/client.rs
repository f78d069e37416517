//! Router client used by Environments to issue `llm_query`/
//! `llm_query_batched` calls without embedding a provider SDK in the
//! sandbox.
//!
//! Grounded on `original_source/rlm/environments/local_repl.py::SocketREPL`'s
//! connect-per-call pattern: each request opens its own TCP connection,
//! matching `spec.md` §5's "Requests arrive on independent client
//! connections."

use std::net::SocketAddr;

use rlm_core::{ChatCompletion, RlmError, RlmResult};
use tokio::net::TcpStream;

use crate::protocol::{read_framed, write_framed, RouterRequest, RouterResponse};

/// Thin client an Environment variant holds to reach the LM Router.
/// `update_router_address` (`spec.md` §4.3) swaps the address in place so
/// the same Environment instance can be rebound across `completion()`
/// calls in persistent-session mode.
#[derive(Debug, Clone)]
pub struct RouterClient {
    addr: SocketAddr,
}

impl RouterClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn update_address(&mut self, addr: SocketAddr) {
        self.addr = addr;
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    async fn round_trip(&self, request: RouterRequest) -> RlmResult<RouterResponse> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| RlmError::router_transport(format!("connect to {}: {e}", self.addr)))?;
        write_framed(&mut stream, &request).await?;
        let response: Option<RouterResponse> = read_framed(&mut stream).await?;
        response.ok_or_else(|| RlmError::router_transport("router closed connection without responding"))
    }

    /// `llm_query(prompt [, model])` — synchronous sub-LM call.
    pub async fn query(
        &self,
        prompt: impl Into<String>,
        model: Option<String>,
        depth: u32,
    ) -> RlmResult<ChatCompletion> {
        let response = self.round_trip(RouterRequest::single(prompt, model, depth)).await?;
        if !response.success {
            return Err(RlmError::router_transport(
                response.error.unwrap_or_else(|| "router request failed".to_string()),
            ));
        }
        response
            .chat_completion
            .ok_or_else(|| RlmError::protocol("single response missing chat_completion"))
    }

    /// `llm_query_batched(prompts [, model])` — concurrent batched sub-LM
    /// call. The result list preserves input order even though the Router
    /// dispatches the calls concurrently (`spec.md` §5).
    pub async fn query_batched(
        &self,
        prompts: Vec<String>,
        model: Option<String>,
        depth: u32,
    ) -> RlmResult<Vec<ChatCompletion>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.round_trip(RouterRequest::batched(prompts, model, depth)).await?;
        if !response.success {
            return Err(RlmError::router_transport(
                response.error.unwrap_or_else(|| "router request failed".to_string()),
            ));
        }
        response
            .chat_completions
            .ok_or_else(|| RlmError::protocol("batched response missing chat_completions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::LmRouter;
    use async_trait::async_trait;
    use rlm_backend::Backend;
    use rlm_core::{ModelUsageSummary, PromptPayload, UsageSummary};
    use std::sync::Arc;

    struct EchoBackend;

    #[async_trait]
    impl Backend for EchoBackend {
        async fn complete(&self, prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
            Ok((prompt.as_text().to_uppercase(), ModelUsageSummary::single_call(1, 1)))
        }
        fn last_usage(&self) -> ModelUsageSummary {
            ModelUsageSummary::single_call(1, 1)
        }
        fn usage_summary(&self) -> UsageSummary {
            UsageSummary::default()
        }
        fn model_name(&self) -> String {
            "echo".to_string()
        }
    }

    #[tokio::test]
    async fn query_round_trips_through_a_live_router() {
        let router = Arc::new(LmRouter::new(Arc::new(EchoBackend)));
        let (addr, handle) = router.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = RouterClient::new(addr);

        let completion = client.query("hi", None, 0).await.unwrap();
        assert_eq!(completion.response, "HI");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn query_batched_preserves_input_order() {
        let router = Arc::new(LmRouter::new(Arc::new(EchoBackend)));
        let (addr, handle) = router.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = RouterClient::new(addr);

        let completions = client
            .query_batched(vec!["a".to_string(), "b".to_string(), "c".to_string()], None, 1)
            .await
            .unwrap();
        assert_eq!(completions.len(), 3);
        assert_eq!(completions[0].response, "A");
        assert_eq!(completions[2].response, "C");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn query_batched_empty_short_circuits_without_a_call() {
        let client = RouterClient::new("127.0.0.1:1".parse().unwrap());
        let completions = client.query_batched(vec![], None, 1).await.unwrap();
        assert!(completions.is_empty());
    }

    #[tokio::test]
    async fn query_against_unreachable_address_fails_as_transport_error() {
        let client = RouterClient::new("127.0.0.1:1".parse().unwrap());
        let result = client.query("hi", None, 0).await;
        assert!(matches!(result, Err(RlmError::RouterTransport(_))));
    }
}
