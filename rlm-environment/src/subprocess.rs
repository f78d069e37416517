//! Subprocess-per-call REPL Environment: spawns a fresh `python3` process
//! for each `execute()`, with the namespace persisted to a JSON state file
//! between calls.
//!
//! Grounded on `kowalski-rlm/src/repl_executor.rs`'s `tokio::process::Command`
//! + `tempfile::TempDir` + `tokio::time::timeout` pattern, extended with the
//! state-file persistence `spec.md` §6 requires ("the namespace is persisted
//! between calls as a binary-safe serialized blob"; here, JSON, since every
//! value that crosses the process boundary is already JSON-shaped by the
//! Router's wire protocol).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rlm_core::{truncate_repr, ChatCompletion, ChatMessage, ReplResult, RlmError, RlmResult};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::environment::{AliasBookkeeping, Environment};
use crate::python_driver;

/// Default per-call execution timeout, matching `spec.md` §5's 300s Router
/// RPC deadline so a sub-LM call blocked inside user code cannot outlive
/// the deadline its own request would already be subject to.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct DriverResult {
    stdout: String,
    stderr: String,
    locals_snapshot: BTreeMap<String, String>,
    llm_calls: Vec<ChatCompletion>,
}

/// One python3-subprocess-per-call Environment. Owns a workspace directory
/// (driver script + state file) exclusively for its lifetime; `cleanup()`
/// removes it.
pub struct SubprocessEnvironment {
    workspace: tempfile::TempDir,
    state_file: PathBuf,
    driver_script: PathBuf,
    router_addr: Mutex<SocketAddr>,
    depth: u32,
    python_bin: String,
    timeout: Duration,
    exec_lock: Mutex<()>,
    book: Mutex<AliasBookkeeping>,
}

impl SubprocessEnvironment {
    /// `depth` is the Router depth this Environment's `llm_query` calls are
    /// tagged with — one deeper than the RLM instance that owns it, per
    /// `spec.md` §4.5.
    pub async fn new(router_addr: SocketAddr, depth: u32) -> RlmResult<Self> {
        let workspace = tempfile::TempDir::new().map_err(RlmError::Io)?;
        let state_file = workspace.path().join("namespace.json");
        let driver_script = workspace.path().join("driver.py");
        fs::write(&driver_script, python_driver::render())
            .await
            .map_err(RlmError::Io)?;
        fs::write(&state_file, "{}").await.map_err(RlmError::Io)?;

        Ok(Self {
            workspace,
            state_file,
            driver_script,
            router_addr: Mutex::new(router_addr),
            depth,
            python_bin: "python3".to_string(),
            timeout: DEFAULT_TIMEOUT,
            exec_lock: Mutex::new(()),
            book: Mutex::new(AliasBookkeeping::default()),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_python_bin(mut self, python_bin: impl Into<String>) -> Self {
        self.python_bin = python_bin.into();
        self
    }

    async fn read_state(&self) -> RlmResult<serde_json::Map<String, serde_json::Value>> {
        let bytes = fs::read(&self.state_file).await.map_err(RlmError::Io)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        Ok(value.as_object().cloned().unwrap_or_default())
    }

    async fn write_state(&self, state: serde_json::Map<String, serde_json::Value>) -> RlmResult<()> {
        let bytes = serde_json::to_vec(&serde_json::Value::Object(state))?;
        fs::write(&self.state_file, bytes).await.map_err(RlmError::Io)
    }

    /// Re-points the reserved `context`/`history` aliases to the canonical
    /// `context_{idx}`/`history_{idx}` entries the bookkeeping says they
    /// currently alias, undoing any shadowing the just-run code did
    /// (`spec.md` §4.3's alias-restoration invariant). Called by `execute`
    /// while still holding `exec_lock`, after the driver has persisted
    /// whatever the script's namespace ended up with.
    async fn restore_aliases(&self) -> RlmResult<()> {
        let book = self.book.lock().await;
        let context_idx = book.current_context_alias();
        let history_idx = book.current_history_alias();
        drop(book);
        if context_idx.is_none() && history_idx.is_none() {
            return Ok(());
        }

        let mut state = self.read_state().await?;
        let mut changed = false;
        if let Some(idx) = context_idx {
            if let Some(value) = state.get(&format!("context_{idx}")).cloned() {
                state.insert("context".to_string(), value);
                changed = true;
            }
        }
        if let Some(idx) = history_idx {
            if let Some(value) = state.get(&format!("history_{idx}")).cloned() {
                state.insert("history".to_string(), value);
                changed = true;
            }
        }
        if changed {
            self.write_state(state).await?;
        }
        Ok(())
    }

    async fn run_driver(&self, code: &str) -> RlmResult<DriverResult> {
        let call_id = Uuid::new_v4();
        let code_file = self.workspace.path().join(format!("{call_id}.py"));
        let result_file = self.workspace.path().join(format!("{call_id}.result.json"));
        fs::write(&code_file, code).await.map_err(RlmError::Io)?;

        let addr = *self.router_addr.lock().await;
        let child = Command::new(&self.python_bin)
            .arg(&self.driver_script)
            .arg(&code_file)
            .arg(&self.state_file)
            .arg(&result_file)
            .arg(addr.to_string())
            .arg(self.depth.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RlmError::environment(format!("failed to spawn python3: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| RlmError::environment(format!("python3 wait failed: {e}")))?,
            Err(_) => {
                return Err(RlmError::environment(format!(
                    "repl execution exceeded {:?}",
                    self.timeout
                )))
            }
        };

        let _ = fs::remove_file(&code_file).await;

        if !Path::new(&result_file).exists() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(RlmError::environment(format!(
                "python3 driver produced no result (sandbox crashed?): {stderr}"
            )));
        }

        let bytes = fs::read(&result_file).await.map_err(RlmError::Io)?;
        let _ = fs::remove_file(&result_file).await;
        let parsed: DriverResult = serde_json::from_slice(&bytes)?;
        Ok(parsed)
    }
}

#[async_trait]
impl Environment for SubprocessEnvironment {
    async fn execute(&self, code: &str) -> RlmResult<ReplResult> {
        let start = Instant::now();
        let _guard = self.exec_lock.lock().await;
        let result = self.run_driver(code).await?;
        self.restore_aliases().await?;
        Ok(ReplResult {
            stdout: result.stdout,
            stderr: result.stderr,
            locals_snapshot: result
                .locals_snapshot
                .into_iter()
                .map(|(k, v)| (k, truncate_repr(&v)))
                .collect(),
            execution_time: start.elapsed(),
            llm_calls: result.llm_calls,
        })
    }

    async fn update_router_address(&self, addr: SocketAddr) {
        *self.router_addr.lock().await = addr;
    }

    async fn add_context(&self, payload: serde_json::Value, idx: Option<usize>) -> RlmResult<usize> {
        let mut book = self.book.lock().await;
        let idx = book.next_context_index(idx);
        let mut state = self.read_state().await?;
        state.insert(format!("context_{idx}"), payload.clone());
        state.insert(format!("session_context_{idx}"), payload.clone());

        let mut history = state
            .get("context_history")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        while history.len() <= idx {
            history.push(serde_json::Value::Null);
        }
        history[idx] = payload;
        state.insert("context_history".to_string(), serde_json::Value::Array(history.clone()));

        if let Some(alias) = book.current_context_alias() {
            state.insert("context".to_string(), history[alias].clone());
        }
        self.write_state(state).await?;
        Ok(idx)
    }

    async fn get_context_count(&self) -> usize {
        self.book.lock().await.context_count
    }

    async fn add_history(&self, messages: Vec<ChatMessage>, idx: Option<usize>) -> RlmResult<usize> {
        let mut book = self.book.lock().await;
        let idx = book.next_history_index(idx);
        let mut state = self.read_state().await?;
        let messages_json = serde_json::to_value(&messages)?;
        state.insert(format!("history_{idx}"), messages_json.clone());

        let mut session_history = state
            .get("session_history")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        while session_history.len() <= idx {
            session_history.push(serde_json::Value::Null);
        }
        session_history[idx] = messages_json;
        state.insert("session_history".to_string(), serde_json::Value::Array(session_history.clone()));

        if let Some(alias) = book.current_history_alias() {
            state.insert("history".to_string(), session_history[alias].clone());
        }
        self.write_state(state).await?;
        Ok(idx)
    }

    async fn get_history_count(&self) -> usize {
        self.book.lock().await.history_count
    }

    async fn set_completion_context(&self, payload: serde_json::Value) {
        if let Ok(mut state) = self.read_state().await {
            state.insert("completion_context".to_string(), payload);
            let _ = self.write_state(state).await;
        }
    }

    async fn cleanup(&self) -> RlmResult<()> {
        // `tempfile::TempDir` removes the workspace on drop; nothing else
        // this variant owns needs releasing.
        Ok(())
    }

    async fn final_var(&self, name: &str) -> String {
        let _guard = self.exec_lock.lock().await;
        let code = format!("print(FINAL_VAR({name:?}))");
        match self.run_driver(&code).await {
            Ok(result) => result.stdout.trim_end_matches('\n').to_string(),
            Err(err) => format!("variable '{name}' could not be resolved: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_environment_creates_an_empty_state_file() {
        let env = SubprocessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).await.unwrap();
        let state = env.read_state().await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn add_context_assigns_sequential_indices_and_persists() {
        let env = SubprocessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).await.unwrap();
        let idx0 = env.add_context(serde_json::json!("first"), None).await.unwrap();
        let idx1 = env.add_context(serde_json::json!("second"), None).await.unwrap();
        assert_eq!(idx0, 0);
        assert_eq!(idx1, 1);
        assert_eq!(env.get_context_count().await, 2);

        let state = env.read_state().await.unwrap();
        assert_eq!(state.get("context").unwrap(), "second");
        assert_eq!(state.get("context_0").unwrap(), "first");
    }

    #[tokio::test]
    #[ignore] // requires python3 on PATH
    async fn executes_code_and_persists_namespace_across_calls() {
        let env = SubprocessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).await.unwrap();
        let result = env.execute("answer = 21 * 2\nprint(answer)").await.unwrap();
        assert_eq!(result.stdout.trim(), "42");

        let final_answer = env.final_var("answer").await;
        assert_eq!(final_answer, "42");
    }

    #[tokio::test]
    #[ignore] // requires python3 on PATH
    async fn uncaught_exception_is_captured_not_fatal() {
        let env = SubprocessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).await.unwrap();
        let result = env.execute("x = 1\nraise ValueError('boom')").await.unwrap();
        assert!(result.stderr.contains("ValueError"));
        assert_eq!(env.final_var("x").await, "1");
    }

    #[tokio::test]
    #[ignore] // requires python3 on PATH
    async fn context_alias_is_restored_after_user_code_shadows_it() {
        let env = SubprocessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).await.unwrap();
        env.add_context(serde_json::json!("hello world"), None).await.unwrap();
        env.execute("context = 'shadowed'").await.unwrap();
        let state = env.read_state().await.unwrap();
        assert_eq!(state.get("context").unwrap(), "hello world");
    }
}
