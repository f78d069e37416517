//! The Iteration Driver state machine (`spec.md` §4.4):
//! `INIT -> PROMPTING -> EXECUTING -> CHECK_TERMINAL -> (PROMPTING | DONE |
//! DEFAULT_ANSWER) -> DONE`.
//!
//! Grounded on `original_source/rlm/core/rlm.py`'s per-completion loop.
//! `INIT` itself (seed history + Router/Environment spawn) lives in
//! [`crate::rlm::Rlm::completion`]; this module is the per-iteration body
//! that function drives once both are up.

use std::sync::Arc;
use std::time::Instant;

use rlm_core::{
    extract_repl_blocks, find_final_marker, ChatMessage, CodeBlock, FinalMarker, PromptPayload,
    RlmConfig, RlmError, RlmIteration, RlmLogger, RlmResult,
};
use rlm_environment::Environment;
use rlm_router::RouterClient;

use crate::prompts;

/// Outcome of driving the iteration loop to completion: the final answer
/// text and the ordered trace of every iteration run (for loggers/tests).
pub struct IterationOutcome {
    pub final_answer: String,
    pub iterations: Vec<RlmIteration>,
}

/// Runs the PROMPTING/EXECUTING/CHECK_TERMINAL cycle until a FINAL marker
/// is honored or `config.max_iterations` is exhausted, at which point the
/// DEFAULT_ANSWER path runs once more. `history` is pre-seeded by the
/// caller with the system prompt and the INIT user message (`spec.md`
/// §4.4 INIT); `extra_bindings` names additional session bindings to
/// enumerate in the per-iteration nudge.
pub async fn run(
    history: &mut Vec<ChatMessage>,
    router_client: &RouterClient,
    environment: &Arc<dyn Environment>,
    config: &RlmConfig,
    extra_bindings: &[String],
    logger: &Arc<dyn RlmLogger>,
) -> RlmResult<IterationOutcome> {
    let mut iterations = Vec::new();

    for iteration in 0..config.max_iterations {
        history.push(ChatMessage::user(prompts::iteration_nudge(iteration, extra_bindings)));

        let iteration_start = Instant::now();
        let prompt_text = PromptPayload::Messages(history.clone()).as_text();
        let completion = router_client.query(prompt_text.clone(), None, 0).await?;
        let response = completion.response.clone();
        history.push(ChatMessage::assistant(response.clone()));

        let code_strings = extract_repl_blocks(&response);
        let mut code_blocks = Vec::with_capacity(code_strings.len());
        for code in &code_strings {
            let result = environment.execute(code).await?;
            code_blocks.push(CodeBlock { code: code.clone(), result });
        }

        // On iteration 0, a FINAL marker is honored only if this same
        // response also ran at least one `repl` block (code runs before
        // the marker is checked, per `spec.md` §4.4 step 4) — otherwise it
        // is ignored, forcing the model to look at `context` before
        // answering (Open Question resolution, see DESIGN.md).
        let guard_blocks_marker = iteration == 0 && code_blocks.is_empty();
        let marker = if guard_blocks_marker { None } else { find_final_marker(&response) };

        if let Some(marker) = marker {
            let final_answer = match marker {
                FinalMarker::Final(text) => text,
                FinalMarker::FinalVar(name) => environment.final_var(&name).await,
            };
            iterations.push(RlmIteration {
                prompt: PromptPayload::Text(prompt_text),
                response,
                code_blocks,
                final_answer: Some(final_answer.clone()),
                iteration_time: Some(iteration_start.elapsed()),
            });
            logger.log_iteration(iterations.last().expect("just pushed"), iteration);
            return Ok(IterationOutcome { final_answer, iterations });
        }

        let mut followup = String::new();
        for (i, block) in code_blocks.iter().enumerate() {
            followup.push_str(&prompts::format_code_block_result(i, &block.code, &block.result));
        }
        if followup.is_empty() {
            followup.push_str(
                "No `repl` block was found in your last response. Emit a \
                 ```repl``` block, or answer with a FINAL marker.",
            );
        }
        history.push(ChatMessage::user(followup));

        iterations.push(RlmIteration {
            prompt: PromptPayload::Text(prompt_text),
            response,
            code_blocks,
            final_answer: None,
            iteration_time: Some(iteration_start.elapsed()),
        });
        logger.log_iteration(iterations.last().expect("just pushed"), iteration);
    }

    // DEFAULT_ANSWER: budget exhausted without a FINAL marker.
    if config.fatal_budget_exhaustion {
        return Err(RlmError::budget(format!(
            "exhausted {} iterations without a FINAL marker",
            config.max_iterations
        )));
    }

    let default_start = Instant::now();
    history.push(ChatMessage::user(prompts::DEFAULT_ANSWER_NUDGE));
    let prompt_text = PromptPayload::Messages(history.clone()).as_text();
    let completion = router_client.query(prompt_text.clone(), None, 0).await?;
    let final_answer = completion.response.clone();
    history.push(ChatMessage::assistant(final_answer.clone()));

    iterations.push(RlmIteration {
        prompt: PromptPayload::Text(prompt_text),
        response: final_answer.clone(),
        code_blocks: Vec::new(),
        final_answer: Some(final_answer.clone()),
        iteration_time: Some(default_start.elapsed()),
    });
    logger.log_iteration(iterations.last().expect("just pushed"), config.max_iterations);

    Ok(IterationOutcome { final_answer, iterations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rlm_backend::Backend;
    use rlm_core::{ModelUsageSummary, ReplResult, UsageSummary};
    use rlm_router::LmRouter;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    /// Replays a fixed scripted sequence of responses, one per call,
    /// matching the "mock Backend" pattern `spec.md` §8's S1-S4 scenarios
    /// describe.
    struct ScriptedBackend {
        script: StdMutex<VecDeque<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<&str>) -> Self {
            Self { script: StdMutex::new(responses.into_iter().map(str::to_string).collect()) }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn complete(&self, _prompt: &PromptPayload) -> RlmResult<(String, ModelUsageSummary)> {
            let response = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "FINAL(no more scripted responses)".to_string());
            Ok((response, ModelUsageSummary::single_call(1, 1)))
        }
        fn last_usage(&self) -> ModelUsageSummary {
            ModelUsageSummary::single_call(1, 1)
        }
        fn usage_summary(&self) -> UsageSummary {
            UsageSummary::default()
        }
        fn model_name(&self) -> String {
            "scripted".to_string()
        }
    }

    struct NullEnvironment;

    #[async_trait]
    impl Environment for NullEnvironment {
        async fn execute(&self, code: &str) -> RlmResult<ReplResult> {
            Ok(ReplResult { stdout: format!("ran: {code}"), ..Default::default() })
        }
        async fn update_router_address(&self, _addr: SocketAddr) {}
        async fn add_context(&self, _payload: serde_json::Value, idx: Option<usize>) -> RlmResult<usize> {
            Ok(idx.unwrap_or(0))
        }
        async fn get_context_count(&self) -> usize {
            1
        }
        async fn add_history(&self, _messages: Vec<ChatMessage>, idx: Option<usize>) -> RlmResult<usize> {
            Ok(idx.unwrap_or(0))
        }
        async fn get_history_count(&self) -> usize {
            0
        }
        async fn set_completion_context(&self, _payload: serde_json::Value) {}
        async fn cleanup(&self) -> RlmResult<()> {
            Ok(())
        }
        async fn final_var(&self, name: &str) -> String {
            format!("'{name}' is not bound")
        }
    }

    async fn harness(responses: Vec<&str>, max_iterations: u32) -> (String, Vec<RlmIteration>) {
        let backend = Arc::new(ScriptedBackend::new(responses));
        let router = Arc::new(LmRouter::new(backend));
        let (addr, handle) = router.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = RouterClient::new(addr);
        let env: Arc<dyn Environment> = Arc::new(NullEnvironment);
        let mut history = vec![ChatMessage::system("sys"), ChatMessage::user("init")];
        let config = RlmConfig::default().with_max_iterations(max_iterations);

        let logger = rlm_core::default_logger();
        let outcome = run(&mut history, &client, &env, &config, &[], &logger).await.unwrap();
        handle.shutdown().await;
        (outcome.final_answer, outcome.iterations)
    }

    #[tokio::test]
    async fn s1_single_turn_direct_final() {
        let (answer, iterations) = harness(
            vec!["```repl\nprint('ok')\n```\nFINAL(hi)"],
            2,
        )
        .await;
        assert_eq!(answer, "hi");
        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].code_blocks.len(), 1);
    }

    #[tokio::test]
    async fn iteration_zero_final_marker_is_ignored() {
        // Iteration 0 contains a FINAL marker, which must be rejected; the
        // scripted second response is honored on iteration 1 instead.
        let (answer, iterations) = harness(
            vec!["FINAL(too early)", "FINAL(now it counts)"],
            3,
        )
        .await;
        assert_eq!(answer, "now it counts");
        assert_eq!(iterations.len(), 2);
    }

    #[tokio::test]
    async fn budget_exhaustion_runs_default_answer_path() {
        let (answer, iterations) = harness(vec!["still thinking, no marker"], 1).await;
        // The default-answer call consumes the next scripted response
        // verbatim (no extraction), which here is the harness's fallback.
        assert!(answer.contains("no more scripted responses"));
        assert_eq!(iterations.len(), 2);
    }

    #[tokio::test]
    async fn no_repl_block_and_no_final_nudges_for_a_repl_block() {
        let (answer, iterations) = harness(
            vec!["just thinking, no code and no marker", "FINAL(done)"],
            3,
        )
        .await;
        assert_eq!(answer, "done");
        assert_eq!(iterations[0].code_blocks.len(), 0);
    }
}
