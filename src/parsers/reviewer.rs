//! Reviewer verdicts.

use super::{extract_json_value, str_field, string_list};
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone)]
pub struct ReviewFinding {
    pub category: String,
    pub severity: String,
    pub file: String,
    pub description: String,
    pub suggestion: String,
}

#[derive(Debug, Clone)]
pub struct ReviewResult {
    /// "approve" or "reject"; anything else fails the parse.
    pub verdict: String,
    pub summary: String,
    pub findings: Vec<ReviewFinding>,
    /// Non-empty concerns force a security checkpoint regardless of verdict.
    pub security_concerns: Vec<String>,
}

impl ReviewResult {
    pub fn approved(&self) -> bool {
        self.verdict == "approve"
    }

    pub fn findings_markdown(&self) -> String {
        let mut out = String::new();
        if !self.summary.is_empty() {
            out.push_str(&format!("{}\n", self.summary));
        }
        for finding in &self.findings {
            out.push_str(&format!(
                "- **{}/{}** {}: {}",
                finding.category, finding.severity, finding.file, finding.description
            ));
            if !finding.suggestion.is_empty() {
                out.push_str(&format!(" (suggestion: {})", finding.suggestion));
            }
            out.push('\n');
        }
        out
    }
}

pub fn parse_reviewer_output(output: &str) -> Option<ReviewResult> {
    let data = extract_json_value(output, "verdict")?;

    let verdict = str_field(&data, "verdict").to_lowercase().trim().to_string();
    if verdict != "approve" && verdict != "reject" {
        error!("Invalid reviewer verdict: {verdict:?}");
        return None;
    }

    let findings = data
        .get("findings")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter(|f| f.is_object())
                .map(|f| ReviewFinding {
                    category: non_empty_or(str_field(f, "category"), "general"),
                    severity: non_empty_or(str_field(f, "severity"), "info"),
                    file: str_field(f, "file"),
                    description: str_field(f, "description"),
                    suggestion: str_field(f, "suggestion"),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ReviewResult {
        verdict,
        summary: str_field(&data, "summary"),
        findings,
        security_concerns: string_list(&data, "security_concerns"),
    })
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_rejection_with_findings() {
        let output = r#"Review follows.
```json
{
  "verdict": "Reject",
  "summary": "bad",
  "findings": [
    {"category": "correctness", "severity": "high", "file": "src/a.rs", "description": "off by one", "suggestion": "use len-1"}
  ],
  "security_concerns": ["secret in log"]
}
```"#;
        let review = parse_reviewer_output(output).unwrap();
        assert!(!review.approved());
        assert_eq!(review.summary, "bad");
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.findings[0].severity, "high");
        assert_eq!(review.security_concerns, vec!["secret in log"]);
    }

    #[test]
    fn defaults_finding_category_and_severity() {
        let output = r#"```json
{"verdict": "approve", "findings": [{"file": "x", "description": "nit"}]}
```"#;
        let review = parse_reviewer_output(output).unwrap();
        assert!(review.approved());
        assert_eq!(review.findings[0].category, "general");
        assert_eq!(review.findings[0].severity, "info");
    }

    #[test]
    fn rejects_unknown_verdicts() {
        assert!(parse_reviewer_output("```json\n{\"verdict\": \"maybe\"}\n```").is_none());
        assert!(parse_reviewer_output("looks good to me!").is_none());
    }
}
