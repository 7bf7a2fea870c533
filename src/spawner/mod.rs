//! Ephemeral agent containers.
//!
//! One container per (task, role) pair. The container receives its whole
//! contract through environment variables and reports back over pub/sub;
//! the orchestrator only spawns, watches, and collects.

pub mod runtime;

pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};

use crate::config::Settings;
use crate::models::{AgentRecord, AgentRole, Task};
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bytes of container log tail kept for post-mortem debugging.
const LOG_TAIL_BYTES: usize = 2048;

pub struct AgentSpawner {
    settings: Settings,
    runtime: Arc<dyn ContainerRuntime>,
}

impl AgentSpawner {
    pub fn new(settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { settings, runtime }
    }

    /// Launch an agent for `task` in `role`.
    ///
    /// `workspace_override` mounts a worktree instead of the main
    /// workspace (parallel mode). Planning roles (PM, Architect) get half
    /// the timeout and turn budget of implementation roles.
    pub async fn spawn_agent(
        &self,
        task: &Task,
        role: AgentRole,
        workspace_override: Option<&Path>,
    ) -> Result<AgentRecord> {
        let mut record = AgentRecord::new(role, &task.id);

        let (timeout, max_turns) = if role.is_planning() {
            (self.settings.agent.timeout / 2, self.settings.agent.max_turns / 2)
        } else {
            (self.settings.agent.timeout, self.settings.agent.max_turns)
        };

        let host_path = match workspace_override {
            Some(path) => path.to_string_lossy().to_string(),
            None => self
                .settings
                .agent
                .host_workspace_path
                .clone()
                .unwrap_or_else(|| self.settings.workspace_path.to_string_lossy().to_string()),
        };

        let env = vec![
            ("TASK_ID".to_string(), task.id.clone()),
            ("AGENT_ID".to_string(), record.id.clone()),
            ("AGENT_ROLE".to_string(), role.as_str().to_string()),
            ("REDIS_URL".to_string(), self.settings.redis.url.clone()),
            ("MEM0_URL".to_string(), self.settings.mem0.url.clone()),
            (
                "ANTHROPIC_API_KEY".to_string(),
                self.settings.anthropic_api_key.clone(),
            ),
            ("WORKSPACE_PATH".to_string(), "/workspace".to_string()),
            (
                "PROJECT_ID".to_string(),
                task.project.clone().unwrap_or_default(),
            ),
            ("AGENT_TIMEOUT".to_string(), timeout.to_string()),
            ("AGENT_MAX_TURNS".to_string(), max_turns.to_string()),
        ];

        let spec = ContainerSpec {
            image: self.settings.agent.image.clone(),
            name: format!("legatus-agent-{}", record.id),
            network: self.settings.agent.network.clone(),
            env,
            volumes: vec![(host_path, "/workspace".to_string())],
        };

        info!(
            "Spawning agent container: image={} agent={} role={} task={}",
            spec.image, record.id, role, task.id
        );

        let container_id = self.runtime.run(&spec).await?;
        record.container_id = Some(container_id);
        Ok(record)
    }

    pub async fn stop_agent(&self, record: &AgentRecord) -> Result<()> {
        if let Some(container_id) = &record.container_id {
            self.runtime.stop(container_id).await?;
        }
        Ok(())
    }

    pub async fn container_status(&self, container_id: &str) -> Result<Option<String>> {
        self.runtime.status(container_id).await
    }

    /// Collect a short log tail, then remove the container. Best-effort:
    /// a gone container is not an error, and log collection failures are
    /// swallowed so cleanup always proceeds.
    pub async fn collect_logs_and_remove(&self, container_id: &str) -> Option<String> {
        let logs = match self.runtime.logs_tail(container_id, LOG_TAIL_BYTES).await {
            Ok(logs) if !logs.is_empty() => Some(logs),
            Ok(_) => None,
            Err(e) => {
                debug!("Could not collect logs for {}: {}", container_id, e);
                None
            }
        };

        if let Err(e) = self.runtime.remove(container_id).await {
            warn!("Failed to remove container {}: {}", container_id, e);
        }

        logs
    }
}
