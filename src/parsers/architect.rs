//! Architect design output.

use super::{extract_json_value, str_field, string_list};
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone)]
pub struct RefinedSubtask {
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub estimated_complexity: String,
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ArchitectPlan {
    pub decisions: Vec<Value>,
    pub interfaces: Vec<Value>,
    pub concerns: Vec<String>,
    pub design_notes: String,
    /// When present, overrides the PM decomposition entirely.
    pub refined_subtasks: Option<Vec<RefinedSubtask>>,
}

impl ArchitectPlan {
    /// Render the design as the markdown appendix attached to dev prompts.
    pub fn guidance_markdown(&self) -> String {
        let mut out = String::from("\n\n## Architecture Guidance\n");
        if !self.design_notes.is_empty() {
            out.push_str(&format!("\n{}\n", self.design_notes));
        }
        if !self.decisions.is_empty() {
            out.push_str("\n### Decisions\n");
            for decision in &self.decisions {
                out.push_str(&format!("- {}\n", render_item(decision)));
            }
        }
        if !self.interfaces.is_empty() {
            out.push_str("\n### Interfaces\n");
            for interface in &self.interfaces {
                out.push_str(&format!("- {}\n", render_item(interface)));
            }
        }
        if !self.concerns.is_empty() {
            out.push_str("\n### Concerns\n");
            for concern in &self.concerns {
                out.push_str(&format!("- {concern}\n"));
            }
        }
        out
    }
}

fn render_item(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            // Common shapes: {"decision": ..., "rationale": ...} or free-form
            let mut parts = Vec::new();
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    parts.push(format!("{k}: {s}"));
                }
            }
            if parts.is_empty() {
                value.to_string()
            } else {
                parts.join("; ")
            }
        }
        other => other.to_string(),
    }
}

/// Extract a structured design from Architect agent output.
///
/// Best-effort: the design is advisory, so a document with at least one
/// of decisions/interfaces/design_notes parses.
pub fn parse_architect_output(output: &str) -> Option<ArchitectPlan> {
    let data = extract_json_value(output, "decisions")?;

    let decisions = data
        .get("decisions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let interfaces = data
        .get("interfaces")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let concerns = string_list(&data, "concerns");
    let design_notes = str_field(&data, "design_notes");

    if decisions.is_empty() && interfaces.is_empty() && design_notes.is_empty() {
        error!("Architect output has no decisions, interfaces, or design notes");
        return None;
    }

    let refined_subtasks = data
        .get("refined_subtasks")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .enumerate()
                .filter(|(_, st)| st.is_object())
                .filter_map(|(i, st)| {
                    let title = str_field(st, "title");
                    let description = str_field(st, "description");
                    if title.is_empty() || description.is_empty() {
                        return None;
                    }
                    Some(RefinedSubtask {
                        title,
                        description,
                        acceptance_criteria: string_list(st, "acceptance_criteria"),
                        estimated_complexity: {
                            let c = str_field(st, "estimated_complexity");
                            if c.is_empty() {
                                "medium".to_string()
                            } else {
                                c
                            }
                        },
                        depends_on: st
                            .get("depends_on")
                            .and_then(Value::as_array)
                            .map(|deps| {
                                deps.iter()
                                    .filter_map(Value::as_u64)
                                    .map(|d| d as usize)
                                    .filter(|&d| d < i)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .filter(|subtasks| !subtasks.is_empty());

    Some(ArchitectPlan {
        decisions,
        interfaces,
        concerns,
        design_notes,
        refined_subtasks,
    })
}
