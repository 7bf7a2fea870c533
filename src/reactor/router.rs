//! Checkpoint-resolution routing.
//!
//! By the time a hook fires, the checkpoint manager has already recorded
//! the decision and moved the task BLOCKED -> ACTIVE. What the decision
//! *means* is decided here, entirely by the checkpoint's source role.

use super::EventBus;
use crate::dispatch::SKIPPED_SUBTASKS_KEY;
use crate::models::{AgentRole, CheckpointSource, TaskStatus};
use crate::Result;
use tracing::{error, info, warn};

/// agent_outputs key remembering which sub-task a pending merge-conflict
/// checkpoint belongs to.
pub(crate) const MERGE_CONFLICT_TASK_KEY: &str = "_merge_conflict_task";

impl EventBus {
    pub async fn on_checkpoint_approved(
        &self,
        task_id: &str,
        source: CheckpointSource,
    ) -> Result<()> {
        info!("Checkpoint approved for {} (source: {})", task_id, source);
        match source {
            CheckpointSource::Pm => self.on_plan_approved(task_id).await,
            CheckpointSource::Architect => self.start_execution(task_id).await,
            CheckpointSource::Reviewer => {
                let task = self.tasks.get_required(task_id).await?;
                self.route_review_approval(task_id, task.is_subtask()).await
            }
            CheckpointSource::Qa => {
                self.tasks
                    .update_status(task_id, TaskStatus::Testing, "user", "qa override approved")
                    .await?;
                self.tasks
                    .update_status(task_id, TaskStatus::Done, "user", "qa override approved")
                    .await?;
                self.after_task_done(task_id).await;
                Ok(())
            }
            CheckpointSource::MergeConflict => self.on_merge_resolution_approved(task_id).await,
            CheckpointSource::AgentFailed => self.on_failure_skip_approved(task_id).await,
            CheckpointSource::PmAcceptance => {
                warn!("pm_acceptance checkpoints are not routed by the core");
                Ok(())
            }
        }
    }

    pub async fn on_checkpoint_rejected(
        &self,
        task_id: &str,
        source: CheckpointSource,
        reason: &str,
    ) -> Result<()> {
        info!(
            "Checkpoint rejected for {} (source: {}): {}",
            task_id, source, reason
        );
        match source {
            CheckpointSource::Pm | CheckpointSource::Architect => {
                // The decomposition is abandoned wholesale.
                self.dispatcher.cleanup_subtasks(task_id).await?;
                self.walk_to_rejected(task_id, "user", &plan_reject_detail(source, reason))
                    .await
            }
            CheckpointSource::Reviewer => {
                let task = self.tasks.get_required(task_id).await?;
                self.tasks
                    .update_status(task_id, TaskStatus::Review, "user", "review rejection upheld")
                    .await?;
                self.tasks
                    .update_status(task_id, TaskStatus::Rejected, "user", reason)
                    .await?;
                if task.branch_name.is_some() {
                    self.cleanup_worktree_and_branch(&task).await;
                }
                if let Some(parent_id) = &task.parent_id {
                    self.cascade_fail_parent(parent_id, &format!("sub-task {} review rejected", task.id))
                        .await;
                }
                Ok(())
            }
            CheckpointSource::Qa => {
                let task = self.tasks.get_required(task_id).await?;
                self.tasks
                    .update_status(task_id, TaskStatus::Testing, "user", "qa failure upheld")
                    .await?;
                self.tasks
                    .update_status(task_id, TaskStatus::Rejected, "user", reason)
                    .await?;
                if task.branch_name.is_some() {
                    self.cleanup_worktree_and_branch(&task).await;
                }
                if let Some(parent_id) = &task.parent_id {
                    self.cascade_fail_parent(parent_id, &format!("sub-task {} failed qa", task.id))
                        .await;
                }
                Ok(())
            }
            CheckpointSource::MergeConflict => self.on_merge_resolution_rejected(task_id).await,
            CheckpointSource::AgentFailed => {
                self.walk_to_rejected(task_id, "user", "campaign abandoned after agent failure")
                    .await
            }
            CheckpointSource::PmAcceptance => Ok(()),
        }
    }

    // ---- pm ------------------------------------------------------------

    async fn on_plan_approved(&self, parent_id: &str) -> Result<()> {
        if self.settings.agent.architect_review {
            if self.spawn_gate(parent_id, AgentRole::Architect).await {
                return Ok(());
            }
            // The design pass is advisory; a missing architect never
            // blocks execution.
            warn!("Architect spawn failed for {}; dispatching anyway", parent_id);
        }
        self.start_execution(parent_id).await
    }

    // ---- merge_conflict ------------------------------------------------

    async fn on_merge_resolution_approved(&self, parent_id: &str) -> Result<()> {
        let conflict_task = self.take_conflict_task(parent_id).await?;

        // The user resolved the conflict in the working copy; commit it.
        {
            let git = self.git.lock().await;
            match git
                .commit_merge_resolution(&format!("legatus: resolve merge conflict ({parent_id})"))
                .await
            {
                Ok(hash) => info!("Merge resolution committed: {}", hash),
                Err(e) => warn!("Merge resolution commit failed: {}", e),
            }
        }

        if let Some(task) = conflict_task {
            self.cleanup_worktree_and_branch(&task).await;
        }

        self.reevaluate_campaign(parent_id).await
    }

    async fn on_merge_resolution_rejected(&self, parent_id: &str) -> Result<()> {
        let conflict_task = self.take_conflict_task(parent_id).await?;

        // Usually already aborted at detection time; tolerate either.
        {
            let git = self.git.lock().await;
            if let Err(e) = git.abort_merge().await {
                warn!("Merge abort on rejection: {}", e);
            }
        }

        if let Some(task) = conflict_task {
            self.cleanup_worktree_and_branch(&task).await;
        }

        self.reevaluate_campaign(parent_id).await
    }

    async fn take_conflict_task(&self, parent_id: &str) -> Result<Option<crate::models::Task>> {
        let mut parent = self.tasks.get_required(parent_id).await?;
        let Some(conflict_id) = parent.agent_outputs.remove(MERGE_CONFLICT_TASK_KEY) else {
            return Ok(None);
        };
        self.tasks.update(parent).await?;
        self.tasks.get(&conflict_id).await
    }

    // ---- agent_failed --------------------------------------------------

    /// The user chose to skip the failed sub-task. Mark every currently
    /// REJECTED child as skipped so completion logic counts it as settled,
    /// then re-evaluate the campaign.
    async fn on_failure_skip_approved(&self, parent_id: &str) -> Result<()> {
        let mut parent = self.tasks.get_required(parent_id).await?;

        let mut skipped: Vec<String> = parent
            .agent_outputs
            .get(SKIPPED_SUBTASKS_KEY)
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        for child_id in parent.subtask_ids.clone() {
            if let Some(child) = self.tasks.get(&child_id).await? {
                if child.status == TaskStatus::Rejected && !skipped.contains(&child.id) {
                    info!("Skipping failed sub-task {}", child.id);
                    skipped.push(child.id);
                }
            }
        }
        parent
            .agent_outputs
            .insert(SKIPPED_SUBTASKS_KEY.to_string(), skipped.join(","));
        self.tasks.update(parent).await?;

        self.reevaluate_campaign(parent_id).await
    }

    /// Re-run the completion classification and finalise if the campaign
    /// just became complete.
    async fn reevaluate_campaign(&self, parent_id: &str) -> Result<()> {
        use crate::dispatch::SubtaskOutcome;
        match self.dispatcher.on_subtask_complete(parent_id).await {
            Ok(Some(SubtaskOutcome::AllDone)) => self.finalize_campaign(parent_id).await,
            Ok(Some(SubtaskOutcome::Failed)) | Ok(None) => Ok(()),
            Err(e) => {
                error!("Campaign re-evaluation failed for {}: {}", parent_id, e);
                Ok(())
            }
        }
    }
}

fn plan_reject_detail(source: CheckpointSource, reason: &str) -> String {
    let stage = match source {
        CheckpointSource::Pm => "plan",
        CheckpointSource::Architect => "design",
        _ => "checkpoint",
    };
    if reason.is_empty() {
        format!("{stage} rejected by user")
    } else {
        format!("{stage} rejected by user: {reason}")
    }
}
