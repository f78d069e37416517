//! Fixed system-prompt templates and per-iteration nudges.
//!
//! Grounded on `original_source/rlm/utils/prompts.py`, which the Open
//! Question in `spec.md` §9 notes keeps several templates (completion vs
//! session, minimal vs full) side by side as "a product concern, not a core
//! contract." This module keeps one template per mode and lets
//! `custom_system_prompt` (`spec.md` §6) replace it verbatim.

use rlm_core::QueryMetadata;

/// The system prompt bootstrapped as the first history message (`spec.md`
/// §4.4 INIT): describes the REPL API, the `context` binding, `llm_query`,
/// `llm_query_batched`, `FINAL_VAR`, the ```` ```repl ```` fence convention,
/// and the mandatory final-answer rule.
pub fn system_prompt(custom: Option<&str>, persistent: bool) -> String {
    if let Some(custom) = custom {
        return custom.to_string();
    }

    let session_note = if persistent {
        "\nThis is a persistent session: earlier turns remain bound as \
         `session_context_0`, `session_context_1`, ... and their message \
         histories as `session_history`. `context` always aliases the most \
         recently added context."
    } else {
        ""
    };

    format!(
        "You are the root reasoning model of a recursive language model \
         runtime. You do not see the full task context directly; instead \
         it is bound as the variable `context` inside a sandboxed REPL you \
         control by emitting code.\n\
         \n\
         To run code, emit a fenced block tagged `repl`:\n\
         ```repl\n\
         <code>\n\
         ```\n\
         Every `repl` block in your response is executed, in order, against \
         a namespace that persists across your turns. Bindings you create \
         are visible on your next turn.\n\
         \n\
         Inside the REPL you have:\n\
         - `context` — the task payload (a string, or a structured \
         collection if the payload was structured).\n\
         - `llm_query(prompt, model=None)` — a synchronous call to a \
         sub-language-model; returns its response as a string.\n\
         - `llm_query_batched(prompts, model=None)` — concurrent batched \
         sub-model calls; returns a list of responses in the same order as \
         `prompts`.\n\
         - `FINAL_VAR(name)` — returns the stringified value of a bound \
         variable; if `name` is not bound it returns a message listing what \
         is bound instead, so you can recover and try again.\n\
         - `print(...)` — captured and shown back to you as stdout.\n\
         \n\
         When you are ready to answer, end your response with either \
         `FINAL(<your answer>)` or `FINAL_VAR(<variable name>)` — never both \
         a `repl` block and a FINAL marker have any special meaning inside a \
         `repl` block, and code always runs before a FINAL marker on the \
         same turn is honored. A FINAL marker only counts outside a `repl` \
         fence.\n\
         \n\
         You must always end with a FINAL marker once you are ready; \
         do not just stop.{session_note}"
    )
}

/// The INIT user message describing the shape of the prompt payload
/// (`spec.md` §4.4 step INIT): "type, total character length, and
/// per-chunk lengths."
pub fn init_user_message(metadata: &QueryMetadata) -> String {
    format!(
        "The task context has been bound to `context`. Its shape: {}.\n\
         Inspect it with code before answering.",
        metadata.render()
    )
}

/// The per-iteration nudge appended before each root-model call (`spec.md`
/// §4.4 step PROMPTING). `extra_bindings` names additional
/// `session_context_i`/`session_history` bindings to enumerate when
/// multiple exist.
pub fn iteration_nudge(iteration: u32, extra_bindings: &[String]) -> String {
    let mut nudge = if iteration == 0 {
        "You have not looked at the context yet — do not answer now. \
         Write `repl` code to inspect `context` first."
            .to_string()
    } else {
        "The prior history above is your interactions with the REPL so \
         far: your code, its stdout/stderr, and any sub-model calls it \
         made. Continue from there, or answer with a FINAL marker if you \
         are ready."
            .to_string()
    };

    if !extra_bindings.is_empty() {
        nudge.push_str(&format!(
            "\nAdditional bindings available this turn: {}.",
            extra_bindings.join(", ")
        ));
    }
    nudge
}

/// The DEFAULT_ANSWER nudge (`spec.md` §4.4 Budget exhaustion): "please
/// provide a final answer based on what you have."
pub const DEFAULT_ANSWER_NUDGE: &str =
    "You are out of iterations. Please provide a final answer based on \
     what you have observed so far. Respond with your answer as plain \
     text; no FINAL marker is needed for this turn.";

/// Formats one executed code block's result for the user message appended
/// after EXECUTING (`spec.md` §4.4 step 5): code, stdout, stderr, a
/// compact locals snapshot, and summaries of any sub-LM calls made.
pub fn format_code_block_result(index: usize, code: &str, result: &rlm_core::ReplResult) -> String {
    let mut out = format!("--- repl block {} ---\n```repl\n{}\n```\n", index + 1, code.trim_end());
    if !result.stdout.is_empty() {
        out.push_str(&format!("stdout:\n{}\n", result.stdout));
    }
    if !result.stderr.is_empty() {
        out.push_str(&format!("stderr:\n{}\n", result.stderr));
    }
    if !result.locals_snapshot.is_empty() {
        out.push_str("locals:\n");
        for (name, value) in &result.locals_snapshot {
            out.push_str(&format!("  {name} = {value}\n"));
        }
    }
    if !result.llm_calls.is_empty() {
        out.push_str(&format!("sub-model calls made: {}\n", result.llm_calls.len()));
        for (i, call) in result.llm_calls.iter().enumerate() {
            let status = if call.is_error() { "error" } else { "ok" };
            out.push_str(&format!(
                "  [{}] model={} status={} response_len={}\n",
                i + 1,
                call.root_model,
                status,
                call.response.len()
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_zero_warns_context_unseen() {
        let nudge = iteration_nudge(0, &[]);
        assert!(nudge.contains("do not answer now"));
    }

    #[test]
    fn later_iterations_recap_history() {
        let nudge = iteration_nudge(1, &[]);
        assert!(nudge.contains("your interactions with the REPL"));
    }

    #[test]
    fn custom_system_prompt_overrides_default() {
        assert_eq!(system_prompt(Some("be terse"), false), "be terse");
    }

    #[test]
    fn code_block_result_includes_stdout_and_locals() {
        let mut result = rlm_core::ReplResult::default();
        result.stdout = "ok\n".to_string();
        result.locals_snapshot.insert("x".to_string(), "1".to_string());
        let formatted = format_code_block_result(0, "x = 1\nprint('ok')", &result);
        assert!(formatted.contains("stdout:\nok"));
        assert!(formatted.contains("x = 1"));
    }
}
