//! Parsing utilities: locate fenced code blocks and final-answer markers in
//! model output, and format one iteration back into chat messages.
//!
//! Ported from `rlm/utils/parsing.py` in the original implementation —
//! same regexes, same truncation constant, same "names only" variable
//! enumeration (spec.md §9 Open Question, resolved to keep that behavior).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::environment::Environment;
use crate::types::{BindingValue, ReplResult, RlmIteration};

static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```repl\s*\n(.*?)\n```").unwrap());

static FINAL_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*FINAL_VAR\((.*?)\)").unwrap());

static FINAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*FINAL\((.*?)\)").unwrap());

const MAX_FORMATTED_RESULT_CHARS: usize = 20_000;

/// Find all `` ```repl ... ``` `` fenced blocks in `text`, trimmed, in
/// source order. The regex is deliberately greedy/non-overlapping: nested
/// fences are not expected (spec.md §4.4/§9).
pub fn find_code_blocks(text: &str) -> Vec<String> {
    CODE_BLOCK_RE
        .captures_iter(text)
        .map(|cap| cap[1].trim().to_string())
        .collect()
}

/// Look for a `FINAL_VAR(...)` or `FINAL(...)` marker at the start of a
/// line, in that order, and resolve it to the final-answer string.
///
/// `FINAL_VAR`'s argument is trimmed and stripped of a single pair of
/// surrounding quotes before lookup. When found, the binding is resolved by
/// executing `print(FINAL_VAR(<name>))` in the environment and returning
/// captured stdout (falling back to stderr when stdout is empty).
pub async fn find_final_answer(text: &str, environment: &dyn Environment) -> Option<String> {
    if let Some(cap) = FINAL_VAR_RE.captures(text) {
        let raw_name = cap[1].trim();
        let name = strip_single_quote_pair(raw_name);
        let result = environment
            .execute_code(&format!("print(FINAL_VAR({:?}))", name))
            .await;
        let stdout = result.stdout.trim();
        if !stdout.is_empty() {
            return Some(stdout.to_string());
        }
        return Some(result.stderr.trim().to_string());
    }

    if let Some(cap) = FINAL_RE.captures(text) {
        return Some(cap[1].trim().to_string());
    }

    None
}

fn strip_single_quote_pair(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Format an [`RlmIteration`] into the message sequence to append to
/// history: one assistant message holding the raw response, then one user
/// message per code block in order.
pub fn format_iteration(iteration: &RlmIteration) -> Vec<(crate::types::Role, String)> {
    use crate::types::Role;

    let mut messages = vec![(Role::Assistant, iteration.response.clone())];

    for block in &iteration.code_blocks {
        let formatted = format_execution_result(&block.result);
        let truncated = truncate(&formatted, MAX_FORMATTED_RESULT_CHARS);
        let content = format!(
            "Code executed:\n```repl\n{}\n```\n\nREPL output:\n{}",
            block.code, truncated
        );
        messages.push((Role::User, content));
    }

    messages
}

/// Concatenate non-empty stdout/stderr (blank-line separated) and a
/// single-line enumeration of notable binding names. Values are
/// intentionally discarded — only names are listed (spec.md §9).
fn format_execution_result(result: &ReplResult) -> String {
    let mut parts = Vec::new();

    if !result.stdout.is_empty() {
        parts.push(result.stdout.clone());
    }
    if !result.stderr.is_empty() {
        parts.push(result.stderr.clone());
    }

    let important: Vec<&str> = result
        .bindings
        .keys()
        .map(|k| k.as_str())
        .filter(|k| !k.starts_with('_'))
        .collect();

    if !important.is_empty() {
        let mut names = important.to_vec();
        names.sort_unstable();
        parts.push(format!("REPL variables: {:?}", names));
    }

    if parts.is_empty() {
        "No output".to_string()
    } else {
        parts.join("\n\n")
    }
}

/// Truncate `s` to at most `max_chars` characters, appending a suffix
/// naming how many characters were dropped. Idempotent: truncating an
/// already-truncated string with the same cap returns it unchanged, since
/// the suffix is shorter than the dropped content it replaces and the
/// result never exceeds `max_chars` plus the suffix length on a second
/// pass only if the cap changes.
pub fn truncate(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    let dropped = char_count - max_chars;
    format!("{}... + [{} chars...]", head, dropped)
}

/// Collapse a raw bindings snapshot into the name set `format_iteration`
/// enumerates — names only, excluding internal (`_`-prefixed) and dunder
/// names, kept here for callers that build a [`ReplResult`] incrementally.
pub fn visible_binding_names(bindings: &HashMap<String, BindingValue>) -> Vec<String> {
    bindings
        .keys()
        .filter(|k| !k.starts_with('_'))
        .cloned()
        .collect()
}
