//! Remote-sandbox REPL Environment: HTTP RPC to a managed sandbox service
//! that owns the actual execution and namespace persistence.
//!
//! Grounded on `kowalski-rlm/src/exo_cluster_manager.rs` and
//! `remote_repl_executor.rs`'s `reqwest::ClientBuilder` pooling + JSON
//! request/response conventions, generalized from Exo's device-targeted
//! REPL endpoint to the namespace-bookkeeping operations `spec.md` §4.3
//! requires every Environment variant to expose.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use rlm_core::{truncate_repr, ChatCompletion, ChatMessage, ReplResult, RlmError, RlmResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::environment::{AliasBookkeeping, Environment};

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    router_addr: String,
    depth: u32,
    /// The index `context`/`history` currently alias, so the sandbox
    /// service can restore them after running `code` in case it shadowed
    /// either reserved name (`spec.md` §4.3's alias-restoration invariant).
    context_idx: Option<usize>,
    history_idx: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    stdout: String,
    stderr: String,
    locals_snapshot: std::collections::BTreeMap<String, String>,
    llm_calls: Vec<ChatCompletion>,
}

#[derive(Debug, Serialize)]
struct ContextRequest {
    payload: serde_json::Value,
    idx: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryRequest {
    messages: Vec<ChatMessage>,
    idx: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Debug, Serialize)]
struct FinalVarRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct FinalVarResponse {
    value: String,
}

/// Environment variant whose execution happens entirely behind an HTTP
/// sandbox service; this struct is a thin RPC client.
pub struct RemoteEnvironment {
    client: Client,
    base_url: String,
    router_addr: Mutex<SocketAddr>,
    depth: u32,
    book: Mutex<AliasBookkeeping>,
}

impl RemoteEnvironment {
    pub fn new(base_url: impl Into<String>, router_addr: SocketAddr, depth: u32) -> RlmResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| RlmError::configuration(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            router_addr: Mutex::new(router_addr),
            depth,
            book: Mutex::new(AliasBookkeeping::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post<T: Serialize, R: for<'de> Deserialize<'de>>(&self, path: &str, body: &T) -> RlmResult<R> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| RlmError::environment(format!("remote sandbox request failed: {e}")))?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RlmError::environment(format!("remote sandbox error: {text}")));
        }
        response
            .json()
            .await
            .map_err(|e| RlmError::environment(format!("malformed remote sandbox response: {e}")))
    }
}

#[async_trait]
impl Environment for RemoteEnvironment {
    async fn execute(&self, code: &str) -> RlmResult<ReplResult> {
        let start = Instant::now();
        let router_addr = self.router_addr.lock().await.to_string();
        let book = self.book.lock().await;
        let context_idx = book.current_context_alias();
        let history_idx = book.current_history_alias();
        drop(book);
        let response: ExecuteResponse = self
            .post(
                "/execute",
                &ExecuteRequest { code, router_addr, depth: self.depth, context_idx, history_idx },
            )
            .await?;
        Ok(ReplResult {
            stdout: response.stdout,
            stderr: response.stderr,
            locals_snapshot: response
                .locals_snapshot
                .into_iter()
                .map(|(k, v)| (k, truncate_repr(&v)))
                .collect(),
            execution_time: start.elapsed(),
            llm_calls: response.llm_calls,
        })
    }

    async fn update_router_address(&self, addr: SocketAddr) {
        *self.router_addr.lock().await = addr;
    }

    async fn add_context(&self, payload: serde_json::Value, idx: Option<usize>) -> RlmResult<usize> {
        let response: IndexResponse = self.post("/context", &ContextRequest { payload, idx }).await?;
        self.book.lock().await.next_context_index(Some(response.index));
        Ok(response.index)
    }

    async fn get_context_count(&self) -> usize {
        match self.client.get(self.url("/context/count")).send().await {
            Ok(response) => response.json::<CountResponse>().await.map(|c| c.count).unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn add_history(&self, messages: Vec<ChatMessage>, idx: Option<usize>) -> RlmResult<usize> {
        let response: IndexResponse = self.post("/history", &HistoryRequest { messages, idx }).await?;
        self.book.lock().await.next_history_index(Some(response.index));
        Ok(response.index)
    }

    async fn get_history_count(&self) -> usize {
        match self.client.get(self.url("/history/count")).send().await {
            Ok(response) => response.json::<CountResponse>().await.map(|c| c.count).unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn set_completion_context(&self, payload: serde_json::Value) {
        let _ = self
            .post::<_, serde_json::Value>("/completion_context", &serde_json::json!({ "payload": payload }))
            .await;
    }

    async fn cleanup(&self) -> RlmResult<()> {
        self.client
            .post(self.url("/cleanup"))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| RlmError::environment(format!("remote sandbox cleanup failed: {e}")))
    }

    async fn final_var(&self, name: &str) -> String {
        match self.post::<_, FinalVarResponse>("/final_var", &FinalVarRequest { name }).await {
            Ok(response) => response.value,
            Err(err) => format!("variable '{name}' could not be resolved: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn execute_round_trips_through_the_remote_sandbox() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/execute");
            then.status(200).json_body(serde_json::json!({
                "stdout": "42\n",
                "stderr": "",
                "locals_snapshot": {"answer": "42"},
                "llm_calls": []
            }));
        });

        let env = RemoteEnvironment::new(server.base_url(), "127.0.0.1:1".parse().unwrap(), 1).unwrap();
        let result = env.execute("answer = 42\nprint(answer)").await.unwrap();
        assert_eq!(result.stdout, "42\n");
        assert_eq!(result.locals_snapshot.get("answer").unwrap(), "42");
        mock.assert();
    }

    #[tokio::test]
    async fn final_var_surfaces_remote_value() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/final_var");
            then.status(200).json_body(serde_json::json!({ "value": "42" }));
        });

        let env = RemoteEnvironment::new(server.base_url(), "127.0.0.1:1".parse().unwrap(), 1).unwrap();
        assert_eq!(env.final_var("answer").await, "42");
    }
}
