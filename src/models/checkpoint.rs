use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Pending,
    Approved,
    Rejected,
}

/// Who (which gate) raised the checkpoint
///
/// Resolution behaviour is entirely source-driven: the event bus routes
/// approve/reject by this value alone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    Pm,
    Architect,
    Reviewer,
    Qa,
    MergeConflict,
    AgentFailed,
    PmAcceptance,
}

impl fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointSource::Pm => "pm",
            CheckpointSource::Architect => "architect",
            CheckpointSource::Reviewer => "reviewer",
            CheckpointSource::Qa => "qa",
            CheckpointSource::MergeConflict => "merge_conflict",
            CheckpointSource::AgentFailed => "agent_failed",
            CheckpointSource::PmAcceptance => "pm_acceptance",
        };
        f.write_str(s)
    }
}

/// A human-in-the-loop pause bound to a task
///
/// Creating a checkpoint blocks the task; resolving it unblocks the task
/// and fires the matching hook on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    pub title: String,
    /// Markdown body shown to the user when deciding.
    pub description: String,
    pub status: CheckpointStatus,
    pub source_role: CheckpointSource,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl Checkpoint {
    pub fn new(
        task_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        source_role: CheckpointSource,
    ) -> Self {
        Self {
            id: format!("cp_{}", &Uuid::new_v4().simple().to_string()[..8]),
            task_id: task_id.into(),
            title: title.into(),
            description: description.into(),
            status: CheckpointStatus::Pending,
            source_role,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            rejection_reason: None,
        }
    }
}
