//! In-process REPL Environment: a `rhai`-embedded sandbox running in the
//! same address space as the driver.
//!
//! **Open Question resolution (see `DESIGN.md`):** the original's
//! in-process variant runs Python via `exec()` against a persistent
//! `globals`/`locals` dict; Rust has no stdlib dynamic interpreter. This
//! variant embeds [`rhai`], whose [`rhai::Scope`] plays the role of the
//! persistent namespace and whose engine has no file/process/`eval` access
//! by default — a stricter sandbox than the original's restricted-builtins
//! table, satisfying `spec.md` §4.3's Safety paragraph by construction. The
//! `repl`-tagged code this variant executes is consequently Rhai's
//! Rust-like script syntax, not Python, unlike the other three variants.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use rhai::{Dynamic, Engine, Scope};
use rlm_core::{truncate_repr, ChatCompletion, ChatMessage, ReplResult, RlmError, RlmResult};
use rlm_router::RouterClient;
use tokio::runtime::Handle;
use tokio::sync::Mutex as TokioMutex;

use crate::environment::{AliasBookkeeping, Environment};

/// Per-call accumulator of sub-LM calls, shared with the registered
/// `llm_query`/`llm_query_batched` Rhai functions via an `Arc`.
type CallLog = Arc<StdMutex<Vec<ChatCompletion>>>;

pub struct InProcessEnvironment {
    engine: Engine,
    scope: TokioMutex<Scope<'static>>,
    router_client: Arc<TokioMutex<RouterClient>>,
    runtime: Handle,
    call_log: CallLog,
    exec_lock: TokioMutex<()>,
    book: TokioMutex<AliasBookkeeping>,
}

impl InProcessEnvironment {
    /// `depth` is the Router depth `llm_query`/`llm_query_batched` calls
    /// are tagged with, one deeper than the RLM instance that owns this
    /// Environment.
    pub fn new(router_addr: SocketAddr, depth: u32) -> RlmResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| RlmError::configuration("InProcessEnvironment requires a running Tokio runtime"))?;
        let router_client = Arc::new(TokioMutex::new(RouterClient::new(router_addr)));
        let call_log: CallLog = Arc::new(StdMutex::new(Vec::new()));

        let mut engine = Engine::new();
        register_llm_query(&mut engine, router_client.clone(), runtime.clone(), call_log.clone(), depth);
        register_llm_query_batched(&mut engine, router_client.clone(), runtime.clone(), call_log.clone(), depth);

        Ok(Self {
            engine,
            scope: TokioMutex::new(Scope::new()),
            router_client,
            runtime,
            call_log,
            exec_lock: TokioMutex::new(()),
            book: TokioMutex::new(AliasBookkeeping::default()),
        })
    }

    fn resolve_final_var(scope: &Scope<'static>, name: &str) -> String {
        if let Some(value) = scope.get_value::<Dynamic>(name) {
            return value.to_string();
        }
        let available: Vec<&str> = scope
            .iter()
            .map(|(n, _, _)| n)
            .filter(|n| !n.starts_with('_'))
            .collect();
        format!("variable '{name}' is not bound; available bindings: {available:?}")
    }
}

fn register_llm_query(
    engine: &mut Engine,
    router_client: Arc<TokioMutex<RouterClient>>,
    runtime: Handle,
    call_log: CallLog,
    depth: u32,
) {
    let client = router_client.clone();
    let rt = runtime.clone();
    let log = call_log.clone();
    engine.register_fn("llm_query", move |prompt: String| -> String {
        call_query(&client, &rt, &log, prompt, None, depth)
    });

    engine.register_fn("llm_query", move |prompt: String, model: String| -> String {
        call_query(&router_client, &runtime, &call_log, prompt, Some(model), depth)
    });
}

fn call_query(
    client: &Arc<TokioMutex<RouterClient>>,
    runtime: &Handle,
    call_log: &CallLog,
    prompt: String,
    model: Option<String>,
    depth: u32,
) -> String {
    let client = client.clone();
    // This host function runs synchronously inside `engine.eval_with_scope`,
    // which `execute()` itself awaits on a Tokio worker thread — i.e. we are
    // already inside the runtime. A bare `Handle::block_on` would panic
    // ("Cannot block the current thread from within a runtime"), so the
    // blocking wait is handed off via `block_in_place` first.
    let completion = tokio::task::block_in_place(|| {
        runtime.block_on(async move {
            let guard = client.lock().await;
            guard.query(prompt, model, depth).await
        })
    });
    match completion {
        Ok(completion) => {
            let response = completion.response.clone();
            call_log.lock().unwrap().push(completion);
            response
        }
        Err(err) => err.as_repl_sentinel(),
    }
}

fn register_llm_query_batched(
    engine: &mut Engine,
    router_client: Arc<TokioMutex<RouterClient>>,
    runtime: Handle,
    call_log: CallLog,
    depth: u32,
) {
    let client = router_client.clone();
    let rt = runtime.clone();
    let log = call_log.clone();
    engine.register_fn("llm_query_batched", move |prompts: rhai::Array| -> rhai::Array {
        call_query_batched(&client, &rt, &log, prompts, None, depth)
    });

    engine.register_fn(
        "llm_query_batched",
        move |prompts: rhai::Array, model: String| -> rhai::Array {
            call_query_batched(&router_client, &runtime, &call_log, prompts, Some(model), depth)
        },
    );
}

fn call_query_batched(
    client: &Arc<TokioMutex<RouterClient>>,
    runtime: &Handle,
    call_log: &CallLog,
    prompts: rhai::Array,
    model: Option<String>,
    depth: u32,
) -> rhai::Array {
    let prompts: Vec<String> = prompts.into_iter().map(|d| d.to_string()).collect();
    if prompts.is_empty() {
        return rhai::Array::new();
    }
    let client = client.clone();
    let result = tokio::task::block_in_place(|| {
        runtime.block_on(async move {
            let guard = client.lock().await;
            guard.query_batched(prompts, model, depth).await
        })
    });
    match result {
        Ok(completions) => {
            let responses: rhai::Array = completions
                .iter()
                .map(|c| Dynamic::from(c.response.clone()))
                .collect();
            call_log.lock().unwrap().extend(completions);
            responses
        }
        Err(err) => {
            let sentinel = Dynamic::from(err.as_repl_sentinel());
            rhai::Array::from([sentinel])
        }
    }
}

#[async_trait]
impl Environment for InProcessEnvironment {
    async fn execute(&self, code: &str) -> RlmResult<ReplResult> {
        let _guard = self.exec_lock.lock().await;
        let start = Instant::now();
        self.call_log.lock().unwrap().clear();

        let mut scope = self.scope.lock().await;
        let mut engine = self.engine.clone();
        let captured = capture_and_eval(&mut engine, &mut scope, code);
        let stdout = captured.stdout;
        let stderr = captured.stderr;

        // `spec.md` §4.3: "Reserved aliases (`context`, `history`) MUST be
        // restored to their canonical targets... after each execution in
        // case user code shadowed them." Re-point them from the numbered
        // binding the bookkeeping says they currently alias.
        {
            let book = self.book.lock().await;
            if let Some(idx) = book.current_context_alias() {
                if let Some(value) = scope.get_value::<Dynamic>(&format!("context_{idx}")) {
                    scope.set_value("context", value);
                }
            }
            if let Some(idx) = book.current_history_alias() {
                if let Some(value) = scope.get_value::<Dynamic>(&format!("history_{idx}")) {
                    scope.set_value("history", value);
                }
            }
        }

        let locals_snapshot: BTreeMap<String, String> = scope
            .iter()
            .filter(|(name, _, _)| !name.starts_with('_'))
            .map(|(name, _, value)| (name.to_string(), truncate_repr(&value.to_string())))
            .collect();

        Ok(ReplResult {
            stdout,
            stderr,
            locals_snapshot,
            execution_time: start.elapsed(),
            llm_calls: self.call_log.lock().unwrap().clone(),
        })
    }

    async fn update_router_address(&self, addr: SocketAddr) {
        self.router_client.lock().await.update_address(addr);
    }

    async fn add_context(&self, payload: serde_json::Value, idx: Option<usize>) -> RlmResult<usize> {
        let mut book = self.book.lock().await;
        let idx = book.next_context_index(idx);
        let mut scope = self.scope.lock().await;
        let dynamic: Dynamic = rhai::serde::to_dynamic(&payload)
            .map_err(|e| RlmError::environment(format!("failed to convert context payload: {e}")))?;
        scope.set_value(format!("context_{idx}"), dynamic.clone());
        scope.set_value(format!("session_context_{idx}"), dynamic.clone());
        if let Some(alias) = book.current_context_alias() {
            if alias == idx {
                scope.set_value("context", dynamic);
            }
        }
        Ok(idx)
    }

    async fn get_context_count(&self) -> usize {
        self.book.lock().await.context_count
    }

    async fn add_history(&self, messages: Vec<ChatMessage>, idx: Option<usize>) -> RlmResult<usize> {
        let mut book = self.book.lock().await;
        let idx = book.next_history_index(idx);
        let mut scope = self.scope.lock().await;
        let payload = serde_json::to_value(&messages)?;
        let dynamic: Dynamic = rhai::serde::to_dynamic(&payload)
            .map_err(|e| RlmError::environment(format!("failed to convert history payload: {e}")))?;
        scope.set_value(format!("history_{idx}"), dynamic.clone());
        if let Some(alias) = book.current_history_alias() {
            if alias == idx {
                scope.set_value("history", dynamic);
            }
        }
        Ok(idx)
    }

    async fn get_history_count(&self) -> usize {
        self.book.lock().await.history_count
    }

    async fn set_completion_context(&self, payload: serde_json::Value) {
        if let Ok(dynamic) = rhai::serde::to_dynamic::<serde_json::Value>(&payload) {
            self.scope.lock().await.set_value("completion_context", dynamic);
        }
    }

    async fn cleanup(&self) -> RlmResult<()> {
        self.scope.lock().await.clear();
        Ok(())
    }

    async fn final_var(&self, name: &str) -> String {
        let scope = self.scope.lock().await;
        Self::resolve_final_var(&scope, name)
    }
}

struct Captured {
    stdout: String,
    stderr: String,
}

/// Evaluates `code` with the engine's print/debug hooks redirected into
/// in-memory buffers for this single call, so `execute()` can return
/// captured stdout/stderr the way every other variant does.
fn capture_and_eval(engine: &mut Engine, scope: &mut Scope<'static>, code: &str) -> Captured {
    let stdout = Arc::new(StdMutex::new(String::new()));
    let stderr = Arc::new(StdMutex::new(String::new()));

    let out = stdout.clone();
    engine.on_print(move |s| {
        let mut buf = out.lock().unwrap();
        buf.push_str(s);
        buf.push('\n');
    });
    let err = stderr.clone();
    engine.on_debug(move |s, _, _| {
        let mut buf = err.lock().unwrap();
        buf.push_str(s);
        buf.push('\n');
    });

    if let Err(eval_err) = engine.eval_with_scope::<Dynamic>(scope, code) {
        stderr.lock().unwrap().push_str(&eval_err.to_string());
    }

    Captured {
        stdout: Arc::try_unwrap(stdout).map(|m| m.into_inner().unwrap()).unwrap_or_default(),
        stderr: Arc::try_unwrap(stderr).map(|m| m.into_inner().unwrap()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_simple_arithmetic_and_persists_namespace() {
        let env = InProcessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).unwrap();
        env.execute("let answer = 21 * 2;").await.unwrap();
        assert_eq!(env.final_var("answer").await, "42");
    }

    #[tokio::test]
    async fn captures_print_output() {
        let env = InProcessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).unwrap();
        let result = env.execute(r#"print("hello");"#).await.unwrap();
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn final_var_on_unbound_name_is_a_diagnostic_not_an_error() {
        let env = InProcessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).unwrap();
        let value = env.final_var("nope").await;
        assert!(value.contains("not bound"));
    }

    #[tokio::test]
    async fn script_errors_are_captured_not_fatal() {
        let env = InProcessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).unwrap();
        let result = env.execute("let x = 1; undefined_fn();").await.unwrap();
        assert!(!result.stderr.is_empty());
        assert_eq!(env.final_var("x").await, "1");
    }

    #[tokio::test]
    async fn add_context_binds_a_reserved_alias() {
        let env = InProcessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).unwrap();
        env.add_context(serde_json::json!("hello world"), None).await.unwrap();
        assert_eq!(env.final_var("context").await, "hello world");
    }

    #[tokio::test]
    async fn context_alias_is_restored_after_user_code_shadows_it() {
        let env = InProcessEnvironment::new("127.0.0.1:1".parse().unwrap(), 1).unwrap();
        env.add_context(serde_json::json!("hello world"), None).await.unwrap();
        env.execute(r#"context = "shadowed";"#).await.unwrap();
        assert_eq!(env.final_var("context").await, "hello world");
    }
}
