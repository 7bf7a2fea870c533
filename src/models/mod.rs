/// Agent records and roles
pub mod agent;
/// Checkpoints and resolution sources
pub mod checkpoint;
/// Cost ledger entries
pub mod cost;
/// Pub/sub message envelopes
pub mod messages;
/// Tasks and the lifecycle state machine
pub mod task;

pub use agent::{AgentRecord, AgentRole, AgentState};
pub use checkpoint::{Checkpoint, CheckpointSource, CheckpointStatus};
pub use cost::{CostBreakdown, CostEntry};
pub use messages::{Message, MessageType, CHANNEL_AGENT, CHANNEL_ORCHESTRATOR};
pub use task::{Task, TaskEvent, TaskStatus, TaskType};
