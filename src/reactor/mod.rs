//! The event reactor.
//!
//! Subscribes to the agent channel and advances the whole orchestration
//! state machine: role demultiplexing, gate chaining (dev -> reviewer ->
//! QA -> done), merges, checkpoint creation on failures, and agent record
//! upkeep. Exactly one message is handled at a time, so task transitions
//! are serialised without explicit locking; everything that waits (store,
//! git, containers) suspends instead of blocking.
//!
//! Handlers are idempotent under at-least-once delivery: each one reloads
//! the task and no-ops unless it is still in the expected pre-transition
//! state. Per-message errors are logged and swallowed; the reactor itself
//! only stops on shutdown.

mod complete;
mod finalize;
mod merge;
mod router;

use crate::checkpoints::CheckpointManager;
use crate::config::Settings;
use crate::dispatch::TaskDispatcher;
use crate::git::GitOps;
use crate::models::{
    AgentRole, AgentState, Message, MessageType, TaskStatus, CHANNEL_AGENT,
};
use crate::spawner::AgentSpawner;
use crate::store::{CostStore, PubSub, StateStore, TaskStore};
use crate::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// WebSocket fan-out capacity; slow clients miss messages rather than
/// backpressuring the reactor.
const WS_CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    pub(crate) settings: Settings,
    pub(crate) tasks: TaskStore,
    pub(crate) state: StateStore,
    pub(crate) costs: CostStore,
    pub(crate) checkpoints: CheckpointManager,
    pub(crate) pubsub: PubSub,
    pub(crate) spawner: Arc<AgentSpawner>,
    pub(crate) git: Arc<Mutex<GitOps>>,
    pub(crate) dispatcher: Arc<TaskDispatcher>,
    ws_tx: broadcast::Sender<String>,
}

impl EventBus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        tasks: TaskStore,
        state: StateStore,
        costs: CostStore,
        checkpoints: CheckpointManager,
        pubsub: PubSub,
        spawner: Arc<AgentSpawner>,
        git: Arc<Mutex<GitOps>>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        let (ws_tx, _) = broadcast::channel(WS_CHANNEL_CAPACITY);
        Self {
            settings,
            tasks,
            state,
            costs,
            checkpoints,
            pubsub,
            spawner,
            git,
            dispatcher,
            ws_tx,
        }
    }

    /// Every agent message, as JSON, for WebSocket clients.
    pub fn subscribe_ws(&self) -> broadcast::Receiver<String> {
        self.ws_tx.subscribe()
    }

    /// Run the reactor loop until the subscription closes (shutdown).
    pub async fn start(&self) -> Result<()> {
        info!("EventBus started, listening on {}", CHANNEL_AGENT);
        let mut messages = self.pubsub.listen(CHANNEL_AGENT).await?;
        while let Some(msg) = messages.recv().await {
            self.handle_agent_message(msg).await;
        }
        info!("EventBus shutting down");
        Ok(())
    }

    /// Handle one agent message end to end. Public for the integration
    /// tests, which drive the reactor without a pub/sub round-trip.
    pub async fn handle_agent_message(&self, msg: Message) {
        info!(
            "Received event: type={:?} task={:?} agent={:?}",
            msg.message_type, msg.task_id, msg.agent_id
        );

        if let Ok(entry) = serde_json::to_value(&msg) {
            if let Err(e) = self.state.append_log(&entry).await {
                warn!("Could not append to activity log: {}", e);
            }
        }

        self.track_agent_activity(&msg).await;

        let result = match msg.message_type {
            MessageType::TaskComplete => self.on_task_complete(&msg).await,
            MessageType::TaskFailed => self.on_task_failed(&msg).await,
            MessageType::LogEntry => Ok(()), // already in the activity log
            other => {
                debug!("Unhandled message type: {:?}", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            // Transient I/O must not escape the per-message handler.
            error!("Handler error for {:?}: {}", msg.message_type, e);
        }

        self.broadcast_to_ws(&msg);
    }

    fn broadcast_to_ws(&self, msg: &Message) {
        if let Ok(json) = serde_json::to_string(msg) {
            let _ = self.ws_tx.send(json);
        }
    }

    /// First message from a STARTING agent flips it to ACTIVE; terminal
    /// messages flip it to STOPPING ahead of cleanup.
    async fn track_agent_activity(&self, msg: &Message) {
        let Some(agent_id) = &msg.agent_id else { return };
        let Ok(Some(mut record)) = self.state.get_agent(agent_id).await else {
            return;
        };

        let next = match msg.message_type {
            MessageType::TaskComplete | MessageType::TaskFailed => Some(AgentState::Stopping),
            _ if record.status == AgentState::Starting => Some(AgentState::Active),
            _ => None,
        };
        if let Some(status) = next {
            record.status = status;
            if let Err(e) = self.state.set_agent(&record).await {
                warn!("Could not update agent {} status: {}", agent_id, e);
            }
        }
    }

    /// Resolve the role an event came from: the agent record when it
    /// still exists, else the id prefix (duplicate deliveries arrive
    /// after the record was cleaned up).
    pub(crate) async fn role_of(&self, msg: &Message) -> Option<AgentRole> {
        if let Some(agent_id) = &msg.agent_id {
            if let Ok(Some(record)) = self.state.get_agent(agent_id).await {
                return Some(record.role);
            }
            if let Some(prefix) = agent_id.split('_').next() {
                return prefix.parse().ok();
            }
        }
        None
    }

    /// Collect the container's log tail (debug only) and drop the agent
    /// record. Best-effort on every step.
    pub(crate) async fn cleanup_agent(&self, agent_id: &str) {
        let record = match self.state.get_agent(agent_id).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        if let Some(container_id) = &record.container_id {
            if let Some(logs) = self.spawner.collect_logs_and_remove(container_id).await {
                debug!("Agent {} container logs:\n{}", agent_id, logs);
            }
        }
        if let Err(e) = self.state.remove_agent(agent_id).await {
            warn!("Could not remove agent record {}: {}", agent_id, e);
        }
    }

    /// Store raw agent output on the task under the role key.
    pub(crate) async fn store_output(&self, task_id: &str, key: &str, output: &str) -> Result<()> {
        let mut task = self.tasks.get_required(task_id).await?;
        task.agent_outputs
            .insert(key.to_string(), output.to_string());
        self.tasks.update(task).await?;
        Ok(())
    }

    /// Walk a task from wherever it is to REJECTED through legal
    /// transitions only.
    pub(crate) async fn walk_to_rejected(&self, task_id: &str, by: &str, detail: &str) -> Result<()> {
        loop {
            let task = self.tasks.get_required(task_id).await?;
            let next = match task.status {
                TaskStatus::Created => TaskStatus::Planned,
                TaskStatus::Planned | TaskStatus::Blocked => TaskStatus::Active,
                TaskStatus::Active => TaskStatus::Review,
                TaskStatus::Review | TaskStatus::Testing => TaskStatus::Rejected,
                TaskStatus::Rejected => return Ok(()),
                TaskStatus::Done => {
                    debug!("Task {} already done; not rejecting", task_id);
                    return Ok(());
                }
            };
            self.tasks.update_status(task_id, next, by, detail).await?;
            if next == TaskStatus::Rejected {
                return Ok(());
            }
        }
    }

    /// Bring a task from a gate state (REVIEW or TESTING) back to ACTIVE
    /// so a checkpoint can block it. The intermediate REJECTED/PLANNED
    /// hops are recorded in history with the given detail.
    pub(crate) async fn park_for_checkpoint(&self, task_id: &str, detail: &str) -> Result<()> {
        loop {
            let task = self.tasks.get_required(task_id).await?;
            let next = match task.status {
                TaskStatus::Review | TaskStatus::Testing => TaskStatus::Rejected,
                TaskStatus::Rejected => TaskStatus::Planned,
                TaskStatus::Planned => TaskStatus::Active,
                TaskStatus::Active => return Ok(()),
                other => {
                    warn!("Cannot park task {} from {:?}", task_id, other);
                    return Ok(());
                }
            };
            self.tasks
                .update_status(task_id, next, "orchestrator", detail)
                .await?;
        }
    }

    /// Cascade a campaign failure when checkpoint creation itself failed.
    pub(crate) async fn cascade_fail_parent(&self, parent_id: &str, detail: &str) {
        if let Err(e) = self.walk_to_rejected(parent_id, "orchestrator", detail).await {
            error!("Could not cascade-fail campaign {}: {}", parent_id, e);
        }
    }

    /// Re-scan for dispatchable work after `resume`.
    pub async fn resume_dispatch(&self) -> Result<()> {
        let campaigns: Vec<_> = self
            .tasks
            .get_by_status(TaskStatus::Active)
            .await?
            .into_iter()
            .filter(|t| t.is_campaign())
            .collect();

        for campaign in campaigns {
            match self.settings.dispatch_mode {
                crate::config::DispatchMode::Parallel => {
                    self.dispatcher.dispatch_all_ready(&campaign.id).await?;
                }
                crate::config::DispatchMode::Sequential => {
                    self.dispatcher.dispatch_next(&campaign.id).await?;
                }
            }
        }
        Ok(())
    }
}
