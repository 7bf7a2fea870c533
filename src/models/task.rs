use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle states for a task
///
/// A campaign (root task) and its sub-tasks share the same lifecycle.
/// `Testing` is only entered when a QA gate is configured for the task's
/// level; `Blocked` is only entered by checkpoint creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Planned,
    Active,
    Review,
    Blocked,
    Testing,
    Rejected,
    Done,
}

impl TaskStatus {
    /// Allowed next states. This table is the single source of truth for
    /// the state machine; `TaskStore::update_status` refuses anything else.
    pub fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Created => &[TaskStatus::Planned],
            TaskStatus::Planned => &[TaskStatus::Active],
            TaskStatus::Active => &[TaskStatus::Review, TaskStatus::Blocked, TaskStatus::Testing],
            TaskStatus::Blocked => &[TaskStatus::Active],
            TaskStatus::Review => &[TaskStatus::Done, TaskStatus::Rejected, TaskStatus::Testing],
            TaskStatus::Testing => &[TaskStatus::Done, TaskStatus::Rejected],
            TaskStatus::Rejected => &[TaskStatus::Planned],
            TaskStatus::Done => &[],
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Terminal states: no agent may be re-dispatched against these.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Rejected)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Planned => "planned",
            TaskStatus::Active => "active",
            TaskStatus::Review => "review",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Testing => "testing",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Feature,
    BugFix,
    Refactor,
    Docs,
    Test,
}

/// One entry in a task's append-only history log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskEvent {
    pub fn new(event: impl Into<String>, by: Option<&str>, detail: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            by: by.map(str::to_string),
            detail: detail.map(str::to_string),
        }
    }
}

/// The fundamental unit of work
///
/// A task with `parent_id = None` and non-empty `subtask_ids` is a campaign.
/// Relations are expressed as ids only; resolution is always a store lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: u8,
    pub created_by: String,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub history: Vec<TaskEvent>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub subtask_ids: Vec<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Raw agent outputs keyed by role, plus small bookkeeping values
    /// (retry counters as decimal strings, the saved original branch).
    #[serde(default)]
    pub agent_outputs: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", &Uuid::new_v4().simple().to_string()[..8]),
            title: title.into(),
            description: description.into(),
            task_type: TaskType::Feature,
            status: TaskStatus::Created,
            priority: 3,
            created_by: "user".to_string(),
            assigned_to: None,
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            history: vec![TaskEvent::new("created", Some("user"), None)],
            parent_id: None,
            subtask_ids: Vec::new(),
            project: None,
            prompt: None,
            branch_name: None,
            agent_outputs: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_campaign(&self) -> bool {
        self.parent_id.is_none() && !self.subtask_ids.is_empty()
    }

    pub fn is_subtask(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Retry counter helper: counters live in `agent_outputs` as decimal
    /// strings so the stored wire format stays stable.
    pub fn retry_count(&self, key: &str) -> u32 {
        self.agent_outputs
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, key: &str, count: u32) {
        self.agent_outputs.insert(key.to_string(), count.to_string());
    }
}
