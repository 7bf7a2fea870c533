//! Checkpoint lifecycle: create, approve, reject.
//!
//! Creating a checkpoint blocks its task; resolving one unblocks the task
//! and leaves the follow-up routing to the event bus hooks
//! (`on_checkpoint_approved` / `on_checkpoint_rejected`). The manager
//! itself never decides what a resolution *means*.

use crate::models::{Checkpoint, CheckpointSource, CheckpointStatus, TaskStatus};
use crate::store::{Store, TaskStore};
use crate::{LegatusError, Result};
use chrono::Utc;
use tracing::info;

const KEY_PREFIX: &str = "checkpoint";
const PENDING_INDEX: &str = "checkpoints:pending";

#[derive(Clone)]
pub struct CheckpointManager {
    store: Store,
    tasks: TaskStore,
}

impl CheckpointManager {
    pub fn new(store: Store, tasks: TaskStore) -> Self {
        Self { store, tasks }
    }

    fn key(checkpoint_id: &str) -> String {
        format!("{KEY_PREFIX}:{checkpoint_id}")
    }

    /// Create a checkpoint and block its task (ACTIVE -> BLOCKED).
    ///
    /// Callers must leave the task ACTIVE before calling; the blocked task
    /// stays parked until a human resolves the checkpoint.
    pub async fn create(
        &self,
        task_id: &str,
        title: &str,
        description: &str,
        source_role: CheckpointSource,
    ) -> Result<Checkpoint> {
        let cp = Checkpoint::new(task_id, title, description, source_role);

        let data = serde_json::to_string(&cp)?;
        self.store.set(&Self::key(&cp.id), &data).await?;
        self.store
            .zadd(
                PENDING_INDEX,
                &cp.id,
                cp.created_at.timestamp_millis() as f64,
            )
            .await?;

        self.tasks
            .update_status(
                task_id,
                TaskStatus::Blocked,
                "checkpoint",
                &format!("checkpoint={}: {title}", cp.id),
            )
            .await?;

        info!(
            "Created checkpoint {} ({}) for task {}",
            cp.id, source_role, task_id
        );
        Ok(cp)
    }

    pub async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        match self.store.get(&Self::key(checkpoint_id)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Pending checkpoints, oldest first.
    pub async fn get_pending(&self) -> Result<Vec<Checkpoint>> {
        let ids = self.store.zrange_all(PENDING_INDEX).await?;
        let mut pending = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(cp) = self.get(&id).await? {
                if cp.status == CheckpointStatus::Pending {
                    pending.push(cp);
                }
            }
        }
        Ok(pending)
    }

    /// Approve: unblocks the task (BLOCKED -> ACTIVE) and records the
    /// resolver. What happens next is the event bus's decision.
    pub async fn approve(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.resolve(checkpoint_id, CheckpointStatus::Approved, None)
            .await
    }

    /// Reject: also unblocks the task so the router can walk it through
    /// further transitions, and records the reason.
    pub async fn reject(&self, checkpoint_id: &str, reason: &str) -> Result<Checkpoint> {
        self.resolve(checkpoint_id, CheckpointStatus::Rejected, Some(reason))
            .await
    }

    async fn resolve(
        &self,
        checkpoint_id: &str,
        status: CheckpointStatus,
        reason: Option<&str>,
    ) -> Result<Checkpoint> {
        let mut cp = self
            .get(checkpoint_id)
            .await?
            .ok_or_else(|| LegatusError::CheckpointNotFound(checkpoint_id.to_string()))?;

        cp.status = status;
        cp.resolved_at = Some(Utc::now());
        cp.resolved_by = Some("user".to_string());
        cp.rejection_reason = reason.map(str::to_string);

        let data = serde_json::to_string(&cp)?;
        self.store.set(&Self::key(&cp.id), &data).await?;
        self.store.zrem(PENDING_INDEX, &cp.id).await?;

        let detail = match reason {
            Some(reason) => format!("checkpoint {} rejected: {reason}", cp.id),
            None => format!("checkpoint {} approved", cp.id),
        };

        // Unblock only if still blocked; a duplicate resolve is a no-op
        // on the task.
        let task = self.tasks.get_required(&cp.task_id).await?;
        if task.status == TaskStatus::Blocked {
            self.tasks
                .update_status(&cp.task_id, TaskStatus::Active, "user", &detail)
                .await?;
        }

        info!("Checkpoint {} resolved: {:?}", cp.id, status);
        Ok(cp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    async fn setup() -> (CheckpointManager, TaskStore, Task) {
        let backend: Store = Arc::new(MemoryBackend::new());
        let tasks = TaskStore::new(backend.clone());
        let manager = CheckpointManager::new(backend, tasks.clone());

        let task = tasks.create(Task::new("t", "d")).await.unwrap();
        tasks
            .update_status(&task.id, TaskStatus::Planned, "test", "")
            .await
            .unwrap();
        let task = tasks
            .update_status(&task.id, TaskStatus::Active, "test", "")
            .await
            .unwrap();
        (manager, tasks, task)
    }

    #[tokio::test]
    async fn create_blocks_the_task() {
        let (manager, tasks, task) = setup().await;

        let cp = manager
            .create(&task.id, "Review plan", "## plan", CheckpointSource::Pm)
            .await
            .unwrap();

        assert_eq!(cp.status, CheckpointStatus::Pending);
        let task = tasks.get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);

        let pending = manager.get_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, cp.id);
    }

    #[tokio::test]
    async fn approve_unblocks_and_clears_pending() {
        let (manager, tasks, task) = setup().await;
        let cp = manager
            .create(&task.id, "Review plan", "", CheckpointSource::Pm)
            .await
            .unwrap();

        let resolved = manager.approve(&cp.id).await.unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Approved);
        assert!(resolved.resolved_at.is_some());

        let task = tasks.get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert!(manager.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reject_records_the_reason() {
        let (manager, tasks, task) = setup().await;
        let cp = manager
            .create(&task.id, "Review plan", "", CheckpointSource::Reviewer)
            .await
            .unwrap();

        let resolved = manager.reject(&cp.id, "needs tests").await.unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Rejected);
        assert_eq!(resolved.rejection_reason.as_deref(), Some("needs tests"));

        // Rejected still unblocks; the router decides what comes next
        let task = tasks.get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn pending_is_ordered_by_creation() {
        let (manager, tasks, task) = setup().await;
        let first = manager
            .create(&task.id, "first", "", CheckpointSource::Pm)
            .await
            .unwrap();

        // Second checkpoint on a second task (a task can only be blocked once)
        let other = tasks.create(Task::new("t2", "d")).await.unwrap();
        tasks.update_status(&other.id, TaskStatus::Planned, "test", "").await.unwrap();
        tasks.update_status(&other.id, TaskStatus::Active, "test", "").await.unwrap();
        let second = manager
            .create(&other.id, "second", "", CheckpointSource::Qa)
            .await
            .unwrap();

        let pending = manager.get_pending().await.unwrap();
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_an_error() {
        let (manager, _tasks, _task) = setup().await;
        assert!(matches!(
            manager.approve("cp_missing").await.unwrap_err(),
            LegatusError::CheckpointNotFound(_)
        ));
    }
}
