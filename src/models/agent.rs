use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Roles an ephemeral agent can run as
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Dev,
    Pm,
    Architect,
    Reviewer,
    Qa,
    Docs,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Dev => "dev",
            AgentRole::Pm => "pm",
            AgentRole::Architect => "architect",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Qa => "qa",
            AgentRole::Docs => "docs",
        }
    }

    /// Planning roles get tighter budgets than implementation roles.
    pub fn is_planning(self) -> bool {
        matches!(self, AgentRole::Pm | AgentRole::Architect)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(AgentRole::Dev),
            "pm" => Ok(AgentRole::Pm),
            "architect" => Ok(AgentRole::Architect),
            "reviewer" => Ok(AgentRole::Reviewer),
            "qa" => Ok(AgentRole::Qa),
            "docs" => Ok(AgentRole::Docs),
            _ => Err(format!("Unknown agent role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Starting,
    Active,
    Stopping,
    Failed,
}

/// Record of one running (or just-stopped) agent
///
/// Exactly one record may reference a given task at a time. Records are
/// removed after the task completes or fails and container logs have been
/// collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub role: AgentRole,
    pub status: AgentState,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentRecord {
    pub fn new(role: AgentRole, task_id: &str) -> Self {
        Self {
            id: format!(
                "{}_{}",
                role.as_str(),
                &Uuid::new_v4().simple().to_string()[..8]
            ),
            role,
            status: AgentState::Starting,
            container_id: None,
            task_id: Some(task_id.to_string()),
            started_at: Some(Utc::now()),
            error: None,
        }
    }
}
