//! Docs agent output. Parsed for completeness; the docs role is not part
//! of the gate chain.

use super::{extract_json_value, str_field, string_list};

#[derive(Debug, Clone)]
pub struct DocsResult {
    pub files_updated: Vec<String>,
    pub summary: String,
}

pub fn parse_docs_output(output: &str) -> Option<DocsResult> {
    let data = extract_json_value(output, "files_updated")?;

    let files_updated = string_list(&data, "files_updated");
    let summary = str_field(&data, "summary");
    if files_updated.is_empty() && summary.is_empty() {
        return None;
    }

    Some(DocsResult {
        files_updated,
        summary,
    })
}
