//! Container-per-RLM REPL Environment: a long-lived container, one `docker
//! exec` per call, code sent as a base64 blob with state persisted in a
//! workspace file inside the container.
//!
//! Grounded on `kowalski-rlm/src/repl_executor.rs`'s process-spawning
//! pattern (here wrapping `docker exec` rather than a bare `python3`
//! invocation) per `spec.md` §6's literal wording and the Open Question
//! resolution in `DESIGN.md` (shell out via `tokio::process::Command`
//! rather than a Docker Engine API client crate).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rlm_core::{truncate_repr, ChatCompletion, ChatMessage, ReplResult, RlmError, RlmResult};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::environment::{AliasBookkeeping, Environment};
use crate::python_driver;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct DriverResult {
    stdout: String,
    stderr: String,
    locals_snapshot: BTreeMap<String, String>,
    llm_calls: Vec<ChatCompletion>,
}

/// Environment variant that executes every call inside one already-running
/// container via `docker exec`. Isolation is delegated entirely to the
/// container runtime (`spec.md` §4.3 Safety: "The container variant
/// delegates isolation to the container runtime").
pub struct ContainerEnvironment {
    container: String,
    workspace_dir: String,
    router_addr: Mutex<SocketAddr>,
    depth: u32,
    timeout: Duration,
    docker_bin: String,
    exec_lock: Mutex<()>,
    book: Mutex<AliasBookkeeping>,
}

impl ContainerEnvironment {
    /// `container` is the name or id of an already-running container with
    /// `python3` on its `PATH`. `workspace_dir` is a path inside the
    /// container where the namespace state file is kept for this
    /// Environment's lifetime.
    pub async fn new(container: impl Into<String>, router_addr: SocketAddr, depth: u32) -> RlmResult<Self> {
        let env = Self {
            container: container.into(),
            workspace_dir: format!("/tmp/rlm-{}", Uuid::new_v4()),
            router_addr: Mutex::new(router_addr),
            depth,
            timeout: DEFAULT_TIMEOUT,
            docker_bin: "docker".to_string(),
            exec_lock: Mutex::new(()),
            book: Mutex::new(AliasBookkeeping::default()),
        };
        env.docker_exec(&["mkdir", "-p", &env.workspace_dir]).await?;
        env.write_state_file(&serde_json::Map::new()).await?;
        Ok(env)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn state_path(&self) -> String {
        format!("{}/namespace.json", self.workspace_dir)
    }

    async fn docker_exec(&self, args: &[&str]) -> RlmResult<std::process::Output> {
        let output = Command::new(&self.docker_bin)
            .arg("exec")
            .arg("-i")
            .arg(&self.container)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RlmError::environment(format!("failed to spawn docker: {e}")))?;
        if !output.status.success() {
            return Err(RlmError::environment(format!(
                "docker exec failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }

    async fn read_state_file(&self) -> RlmResult<serde_json::Map<String, serde_json::Value>> {
        let output = self.docker_exec(&["cat", &self.state_path()]).await?;
        let value: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| RlmError::environment(format!("malformed namespace state: {e}")))?;
        Ok(value.as_object().cloned().unwrap_or_default())
    }

    async fn write_state_file(&self, state: &serde_json::Map<String, serde_json::Value>) -> RlmResult<()> {
        let body = serde_json::to_vec(&serde_json::Value::Object(state.clone()))?;
        let mut child = Command::new(&self.docker_bin)
            .arg("exec")
            .arg("-i")
            .arg(&self.container)
            .arg("tee")
            .arg(self.state_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RlmError::environment(format!("failed to spawn docker: {e}")))?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(&body)
            .await
            .map_err(RlmError::Io)?;
        let status = child.wait().await.map_err(RlmError::Io)?;
        if !status.success() {
            return Err(RlmError::environment("failed to write namespace state into container"));
        }
        Ok(())
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

        let mut state = self.read_state_file().await?;
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
            self.write_state_file(&state).await?;
        }
        Ok(())
    }

    async fn run_driver(&self, code: &str) -> RlmResult<DriverResult> {
        let result_path = format!("{}/{}.result.json", self.workspace_dir, Uuid::new_v4());
        let code_b64 = BASE64.encode(code.as_bytes());
        let addr = *self.router_addr.lock().await;

        let mut child = Command::new(&self.docker_bin)
            .arg("exec")
            .arg("-i")
            .arg("-e")
            .arg(format!("RLM_CODE_B64={code_b64}"))
            .arg(&self.container)
            .arg("python3")
            .arg("-")
            .arg("-")
            .arg(self.state_path())
            .arg(&result_path)
            .arg(addr.to_string())
            .arg(self.depth.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RlmError::environment(format!("failed to spawn docker exec: {e}")))?;

        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(python_driver::render().as_bytes())
            .await
            .map_err(RlmError::Io)?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| RlmError::environment(format!("docker exec wait failed: {e}")))?,
            Err(_) => {
                return Err(RlmError::environment(format!(
                    "container repl execution exceeded {:?}",
                    self.timeout
                )))
            }
        };

        if !output.status.success() {
            return Err(RlmError::environment(format!(
                "container repl exited with failure: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let result_output = self.docker_exec(&["cat", &result_path]).await?;
        self.docker_exec(&["rm", "-f", &result_path]).await?;
        let parsed: DriverResult = serde_json::from_slice(&result_output.stdout)?;
        Ok(parsed)
    }
}

#[async_trait]
impl Environment for ContainerEnvironment {
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
        let mut state = self.read_state_file().await?;
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
        self.write_state_file(&state).await?;
        Ok(idx)
    }

    async fn get_context_count(&self) -> usize {
        self.book.lock().await.context_count
    }

    async fn add_history(&self, messages: Vec<ChatMessage>, idx: Option<usize>) -> RlmResult<usize> {
        let mut book = self.book.lock().await;
        let idx = book.next_history_index(idx);
        let mut state = self.read_state_file().await?;
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
        self.write_state_file(&state).await?;
        Ok(idx)
    }

    async fn get_history_count(&self) -> usize {
        self.book.lock().await.history_count
    }

    async fn set_completion_context(&self, payload: serde_json::Value) {
        if let Ok(mut state) = self.read_state_file().await {
            state.insert("completion_context".to_string(), payload);
            let _ = self.write_state_file(&state).await;
        }
    }

    async fn cleanup(&self) -> RlmResult<()> {
        self.docker_exec(&["rm", "-rf", &self.workspace_dir]).await.map(|_| ())
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
