//! PM acceptance review of a finished campaign.

use super::{extract_json_value, str_field};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct PmAcceptanceResult {
    /// "accept" or "reject".
    pub verdict: String,
    pub summary: String,
    pub criteria_results: Vec<Value>,
    pub feedback: String,
}

impl PmAcceptanceResult {
    pub fn accepted(&self) -> bool {
        self.verdict == "accept"
    }
}

pub fn parse_pm_acceptance_output(output: &str) -> Option<PmAcceptanceResult> {
    let data = extract_json_value(output, "verdict")?;

    let verdict = str_field(&data, "verdict").to_lowercase().trim().to_string();
    if verdict != "accept" && verdict != "reject" {
        return None;
    }

    Some(PmAcceptanceResult {
        verdict,
        summary: str_field(&data, "summary"),
        criteria_results: data
            .get("criteria_results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        feedback: str_field(&data, "feedback"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_accept_with_criteria() {
        let output = r#"```json
{"verdict": "accept", "criteria_results": [{"criterion": "readme exists", "met": true}], "feedback": "ship it"}
```"#;
        let result = parse_pm_acceptance_output(output).unwrap();
        assert!(result.accepted());
        assert_eq!(result.criteria_results.len(), 1);
        assert_eq!(result.feedback, "ship it");
    }

    #[test]
    fn rejects_unknown_verdicts() {
        assert!(parse_pm_acceptance_output("```json\n{\"verdict\": \"pass\"}\n```").is_none());
    }
}
