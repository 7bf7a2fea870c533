use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pub/sub channel carrying agent-emitted events into the reactor.
pub const CHANNEL_AGENT: &str = "events:agent";
/// Reserved: orchestrator-emitted commands to agents.
pub const CHANNEL_ORCHESTRATOR: &str = "events:orchestrator";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Orchestrator -> agent
    TaskAssignment,
    TaskCancel,

    // Agent -> orchestrator
    TaskUpdate,
    TaskComplete,
    TaskFailed,
    CheckpointRequest,
    LogEntry,

    // Orchestrator -> clients (WebSocket)
    StatusUpdate,
    CheckpointNotification,
    AgentEvent,
}

/// The wire envelope for every pub/sub message
///
/// `data` is opaque to the bus; handlers pull typed fields out of it.
/// The reactor consumes `task_complete`, `task_failed` and `log_entry`;
/// everything else is reserved and forwarded to WebSocket clients as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            task_id: None,
            agent_id: None,
            timestamp: Utc::now(),
            data: Map::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }
}
