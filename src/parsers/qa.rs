//! QA verdicts and test evidence.

use super::{extract_json_value, str_field};
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub name: String,
    /// pass / fail / error / skip as reported by the agent.
    pub status: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct QaResult {
    /// "pass" or "fail"; anything else fails the parse.
    pub verdict: String,
    pub summary: String,
    pub tests_written: Vec<String>,
    pub test_results: Vec<TestOutcome>,
    pub failure_details: String,
}

impl QaResult {
    pub fn passed(&self) -> bool {
        self.verdict == "pass"
    }

    pub fn report_markdown(&self) -> String {
        let mut out = String::new();
        if !self.summary.is_empty() {
            out.push_str(&format!("{}\n", self.summary));
        }
        for result in &self.test_results {
            out.push_str(&format!("- `{}`: {}\n", result.name, result.status));
        }
        if !self.failure_details.is_empty() {
            out.push_str(&format!("\n{}\n", self.failure_details));
        }
        out
    }
}

pub fn parse_qa_output(output: &str) -> Option<QaResult> {
    let data = extract_json_value(output, "verdict")?;

    let verdict = str_field(&data, "verdict").to_lowercase().trim().to_string();
    if verdict != "pass" && verdict != "fail" {
        error!("Invalid QA verdict: {verdict:?}");
        return None;
    }

    // tests_written entries may be plain strings or {file, description}
    let tests_written = data
        .get("tests_written")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => {
                        let file = str_field(item, "file");
                        (!file.is_empty()).then_some(file)
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let test_results = data
        .get("test_results")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter(|item| item.is_object())
                .map(|item| TestOutcome {
                    name: str_field(item, "name"),
                    status: str_field(item, "status"),
                    output: str_field(item, "output"),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(QaResult {
        verdict,
        summary: str_field(&data, "summary"),
        tests_written,
        test_results,
        failure_details: str_field(&data, "failure_details"),
    })
}
