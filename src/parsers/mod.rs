//! Structured-output parsing for agent prose.
//!
//! Agents are asked to end their output with one fenced ```json block, but
//! the orchestrator cannot count on that. Every parser follows the same
//! two-step strategy:
//!
//! 1. Prefer the *last* fenced ```json block (the final answer).
//! 2. Fall back to scanning for a balanced `{...}` object containing a
//!    role-specific sentinel key.
//!
//! Malformed items inside an otherwise-valid document are dropped
//! silently; a document with nothing salvageable parses to `None`.

pub mod architect;
pub mod docs;
pub mod pm;
pub mod pm_acceptance;
pub mod qa;
pub mod reviewer;

pub use architect::{parse_architect_output, ArchitectPlan, RefinedSubtask};
pub use docs::{parse_docs_output, DocsResult};
pub use pm::{parse_pm_output, PmPlan, SubtaskPlan};
pub use pm_acceptance::{parse_pm_acceptance_output, PmAcceptanceResult};
pub use qa::{parse_qa_output, QaResult, TestOutcome};
pub use reviewer::{parse_reviewer_output, ReviewFinding, ReviewResult};

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*\n(.*?)\n\s*```").expect("static regex"))
}

/// Content of the last ```json fence, if any.
pub(crate) fn extract_fenced_json(output: &str) -> Option<String> {
    fenced_json_re()
        .captures_iter(output)
        .last()
        .map(|caps| caps[1].trim().to_string())
}

/// First balanced top-level `{...}` object whose text contains the quoted
/// sentinel key.
pub(crate) fn extract_object_with_key(output: &str, sentinel: &str) -> Option<String> {
    let needle = format!("\"{sentinel}\"");
    let mut depth = 0usize;
    let mut start = None;
    for (i, ch) in output.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start {
                            let candidate = &output[s..=i];
                            if candidate.contains(&needle) {
                                return Some(candidate.to_string());
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Shared front-half of every parser: fenced block first, sentinel scan
/// second, then JSON deserialization.
pub(crate) fn extract_json_value(output: &str, sentinel: &str) -> Option<Value> {
    let json_str =
        extract_fenced_json(output).or_else(|| extract_object_with_key(output, sentinel))?;
    match serde_json::from_str(&json_str) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("Failed to parse agent JSON ({sentinel}): {e}");
            None
        }
    }
}

pub(crate) fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
