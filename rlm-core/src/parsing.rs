//! Deterministic code-fence extraction and FINAL/FINAL_VAR marker scanning.
//!
//! Grounded on `kowalski-rlm/src/code_block_parser.rs`'s lazy_static regex
//! approach to fence detection, generalized to match `spec.md` §9 Design
//! Notes exactly: "(1) masks out fenced code blocks, (2) finds the first
//! marker with balanced parentheses, (3) resolves `FINAL_VAR` by looking up
//! the current namespace."

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Matches a fenced code block of any language tag: ```` ```lang\n...\n``` ````.
    /// `(?s)` makes `.` match newlines so multi-line bodies are captured.
    static ref FENCE_RE: Regex = Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```").unwrap();

    /// Matches the start of either marker. Checked against the *masked*
    /// text so markers inside fenced blocks are never honored.
    static ref MARKER_START_RE: Regex = Regex::new(r"FINAL_VAR\(|FINAL\(").unwrap();
}

/// Extracts all fenced blocks tagged `repl`, in textual order.
pub fn extract_repl_blocks(response: &str) -> Vec<String> {
    FENCE_RE
        .captures_iter(response)
        .filter_map(|caps| {
            let lang = caps.get(1).map(|m| m.as_str().trim().to_lowercase()).unwrap_or_default();
            if lang == "repl" {
                Some(caps.get(2).unwrap().as_str().to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Replaces every fenced block's span (fence markers included) with spaces
/// of equal length, so the character offsets of the *non-fenced* remainder
/// are unchanged and later balanced-paren scanning can index into the
/// original text directly.
fn mask_fenced_blocks(response: &str) -> String {
    let mut masked: Vec<char> = response.chars().collect();
    for m in FENCE_RE.find_iter(response) {
        for c in masked[m.start()..m.end()].iter_mut() {
            if *c != '\n' {
                *c = ' ';
            }
        }
    }
    masked.into_iter().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalMarker {
    /// `FINAL(<text>)` — the literal text is the final answer.
    Final(String),
    /// `FINAL_VAR(<name>)` — `name` must be resolved against the
    /// Environment namespace by the caller (via `FINAL_VAR`).
    FinalVar(String),
}

/// Scans `response` for the first FINAL/FINAL_VAR marker that appears
/// outside any `repl` fence, per `spec.md` §4.4 step 4 and §9's scanner
/// strategy. Returns `None` if no marker is found outside a fence.
pub fn find_final_marker(response: &str) -> Option<FinalMarker> {
    let masked = mask_fenced_blocks(response);
    let start_match = MARKER_START_RE.find(&masked)?;
    let start = start_match.start();

    let is_final_var = response[start..].starts_with("FINAL_VAR(");
    let open_paren_idx = if is_final_var {
        start + "FINAL_VAR".len()
    } else {
        start + "FINAL".len()
    };

    let close_paren_idx = find_matching_paren(response, open_paren_idx)?;
    let body = &response[open_paren_idx + 1..close_paren_idx];

    if is_final_var {
        let name = body.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        Some(FinalMarker::FinalVar(name))
    } else {
        Some(FinalMarker::Final(body.to_string()))
    }
}

/// Given the byte index of an opening `(`, scans forward counting paren
/// balance and returns the index of the matching `)`.
fn find_matching_paren(text: &str, open_idx: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open_idx) != Some(&b'(') {
        return None;
    }
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate().skip(open_idx) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_repl_block_in_order() {
        let response = "```repl\nprint('ok')\n```\nFINAL(hi)";
        let blocks = extract_repl_blocks(response);
        assert_eq!(blocks, vec!["print('ok')\n"]);
    }

    #[test]
    fn extracts_multiple_repl_blocks_in_textual_order() {
        let response = "```repl\na = 1\n```\ntext\n```repl\nb = 2\n```";
        let blocks = extract_repl_blocks(response);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("a = 1"));
        assert!(blocks[1].contains("b = 2"));
    }

    #[test]
    fn ignores_non_repl_fences() {
        let response = "```python\nx = 1\n```";
        assert!(extract_repl_blocks(response).is_empty());
    }

    #[test]
    fn finds_final_marker_with_text() {
        let response = "some reasoning\nFINAL(the answer is 42)";
        assert_eq!(
            find_final_marker(response),
            Some(FinalMarker::Final("the answer is 42".to_string()))
        );
    }

    #[test]
    fn finds_final_marker_with_balanced_parens() {
        let response = "FINAL(the result is (42) exactly)";
        assert_eq!(
            find_final_marker(response),
            Some(FinalMarker::Final("the result is (42) exactly".to_string()))
        );
    }

    #[test]
    fn finds_final_var_marker() {
        let response = "FINAL_VAR(answer)";
        assert_eq!(
            find_final_marker(response),
            Some(FinalMarker::FinalVar("answer".to_string()))
        );
    }

    #[test]
    fn ignores_marker_inside_repl_fence() {
        let response = "```repl\n# FINAL(fake)\nx = 1\n```\nno marker here";
        assert_eq!(find_final_marker(response), None);
    }

    #[test]
    fn honors_marker_outside_fence_even_with_repl_block_present() {
        let response = "```repl\nanswer = 42\n```\nFINAL_VAR(answer)";
        assert_eq!(
            find_final_marker(response),
            Some(FinalMarker::FinalVar("answer".to_string()))
        );
        assert_eq!(extract_repl_blocks(response).len(), 1);
    }

    #[test]
    fn no_marker_returns_none() {
        let response = "just thinking out loud, no marker yet";
        assert_eq!(find_final_marker(response), None);
    }
}
