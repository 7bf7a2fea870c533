//! PM decomposition plans.

use super::{extract_json_value, str_field, string_list};
use serde_json::Value;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskPlan {
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub estimated_complexity: String,
    /// 0-based indices into *earlier* subtasks of the same plan.
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct PmPlan {
    pub analysis: String,
    pub subtasks: Vec<SubtaskPlan>,
}

/// Extract a structured plan from PM agent output.
///
/// Returns `None` when no usable plan exists: the caller treats that as a
/// planning failure for the campaign.
pub fn parse_pm_output(output: &str) -> Option<PmPlan> {
    let data = extract_json_value(output, "subtasks")?;

    let raw_subtasks = match data.get("subtasks").and_then(Value::as_array) {
        Some(list) if !list.is_empty() => list,
        _ => {
            error!("PM plan has no subtasks");
            return None;
        }
    };

    let mut subtasks = Vec::new();
    for (i, raw) in raw_subtasks.iter().enumerate() {
        if !raw.is_object() {
            continue;
        }
        let title = str_field(raw, "title");
        let description = str_field(raw, "description");
        if title.is_empty() || description.is_empty() {
            warn!("Subtask {i} missing title or description, skipping");
            continue;
        }

        // Forward or self references would make the dependency graph cyclic;
        // out-of-range values are dropped with the rest.
        let depends_on = raw
            .get("depends_on")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_u64)
                    .map(|d| d as usize)
                    .filter(|&d| d < i)
                    .collect()
            })
            .unwrap_or_default();

        subtasks.push(SubtaskPlan {
            title,
            description,
            acceptance_criteria: string_list(raw, "acceptance_criteria"),
            estimated_complexity: {
                let c = str_field(raw, "estimated_complexity");
                if c.is_empty() {
                    "medium".to_string()
                } else {
                    c
                }
            },
            depends_on,
        });
    }

    if subtasks.is_empty() {
        error!("No valid subtasks found in PM plan");
        return None;
    }

    Some(PmPlan {
        analysis: str_field(&data, "analysis"),
        subtasks,
    })
}
