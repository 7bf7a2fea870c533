//! TASK_COMPLETE handling: role demux and the gate chain.

use super::EventBus;
use crate::dispatch::SubtaskOutcome;
use crate::models::{
    AgentRole, Checkpoint, CheckpointSource, Message, Task, TaskStatus,
};
use crate::parsers::{
    parse_architect_output, parse_pm_output, parse_qa_output, parse_reviewer_output, PmPlan,
};
use crate::Result;
use tracing::{debug, error, info, warn};

impl EventBus {
    pub(crate) async fn on_task_complete(&self, msg: &Message) -> Result<()> {
        let Some(task_id) = msg.task_id.clone() else {
            return Ok(());
        };
        let output = msg.data_str("output").unwrap_or_default().to_string();

        let role = self.role_of(msg).await;

        // Cost accounting is advisory and must never block the gate chain.
        if let Some(cost) = msg.data_f64("cost") {
            if let Ok(Some(task)) = self.tasks.get(&task_id).await {
                let role_name = role.map(|r| r.as_str()).unwrap_or("unknown");
                if let Err(e) = self
                    .costs
                    .record(&task_id, role_name, cost, task.project.as_deref())
                    .await
                {
                    warn!("Could not record cost for {}: {}", task_id, e);
                }
            }
        }

        match role {
            Some(AgentRole::Pm) => self.handle_pm_complete(&task_id, &output).await?,
            Some(AgentRole::Architect) => self.handle_architect_complete(&task_id, &output).await?,
            Some(AgentRole::Dev) => self.handle_dev_complete(&task_id, &output).await?,
            Some(AgentRole::Reviewer) => self.handle_reviewer_complete(&task_id, &output).await?,
            Some(AgentRole::Qa) => self.handle_qa_complete(&task_id, &output).await?,
            Some(AgentRole::Docs) => {
                self.store_output(&task_id, "docs", &output).await?;
            }
            None => {
                warn!("TASK_COMPLETE for {} from unknown agent; ignoring", task_id);
            }
        }

        if let Some(agent_id) = &msg.agent_id {
            self.cleanup_agent(agent_id).await;
        }
        Ok(())
    }

    pub(crate) async fn on_task_failed(&self, msg: &Message) -> Result<()> {
        let Some(task_id) = msg.task_id.clone() else {
            return Ok(());
        };
        let error_detail = msg.data_str("error").unwrap_or("Unknown error").to_string();

        let task = match self.tasks.get(&task_id).await? {
            Some(task) => task,
            None => return Ok(()),
        };

        // Duplicate delivery after the task already settled.
        if task.status.is_terminal() {
            debug!("TASK_FAILED for terminal task {}; no-op", task_id);
            if let Some(agent_id) = &msg.agent_id {
                self.cleanup_agent(agent_id).await;
            }
            return Ok(());
        }

        error!("Task {} failed: {}", task_id, error_detail);
        self.walk_to_rejected(&task_id, "agent", &format!("failed: {error_detail}"))
            .await?;

        // A dead agent leaves its worktree unusable; drop it.
        if task.branch_name.is_some() {
            self.cleanup_worktree_and_branch(&task).await;
        }

        if let Some(parent_id) = &task.parent_id {
            let parent = self.tasks.get_required(parent_id).await?;
            if parent.status == TaskStatus::Blocked {
                // A pending checkpoint already owns the campaign; the
                // rejected child surfaces at the next re-evaluation.
                debug!("Campaign {} already blocked; no extra checkpoint", parent_id);
            } else {
                let title = format!("Agent failed on sub-task: {}", task.title);
                let description = format!(
                    "Sub-task `{}` failed:\n\n```\n{}\n```\n\nApprove to skip it and \
                     continue the campaign; reject to abandon the campaign.",
                    task.id, error_detail
                );
                match self
                    .create_checkpoint_on(parent_id, &title, &description, CheckpointSource::AgentFailed)
                    .await
                {
                    Ok(cp) => info!("Created agent_failed checkpoint {} on {}", cp.id, parent_id),
                    Err(e) => {
                        // Fallback when even the checkpoint cannot be stored.
                        error!("Could not create agent_failed checkpoint: {}", e);
                        self.cascade_fail_parent(parent_id, &format!("sub-task {} failed", task.id))
                            .await;
                    }
                }
            }
        }

        if let Some(agent_id) = &msg.agent_id {
            self.cleanup_agent(agent_id).await;
        }
        Ok(())
    }

    /// Create a checkpoint on a task that may currently be in a gate
    /// state; parks it back to ACTIVE first when needed.
    pub(crate) async fn create_checkpoint_on(
        &self,
        task_id: &str,
        title: &str,
        description: &str,
        source: CheckpointSource,
    ) -> Result<Checkpoint> {
        let task = self.tasks.get_required(task_id).await?;
        if matches!(task.status, TaskStatus::Review | TaskStatus::Testing) {
            self.park_for_checkpoint(task_id, "awaiting user decision")
                .await?;
        }
        self.checkpoints
            .create(task_id, title, description, source)
            .await
    }

    // ---- PM ------------------------------------------------------------

    async fn handle_pm_complete(&self, task_id: &str, output: &str) -> Result<()> {
        let parent = self.tasks.get_required(task_id).await?;
        if parent.status != TaskStatus::Active {
            debug!("PM complete for {} in {:?}; no-op", task_id, parent.status);
            return Ok(());
        }

        self.store_output(task_id, "pm", output).await?;

        let Some(plan) = parse_pm_output(output) else {
            // The campaign cannot proceed without a plan; nothing else is
            // blocked by failing it.
            error!("PM output for {} is unparseable; failing campaign", task_id);
            self.walk_to_rejected(task_id, "orchestrator", "PM output unparseable")
                .await?;
            return Ok(());
        };

        let child_ids = self.create_subtasks(&parent, &plan).await?;

        let mut parent = self.tasks.get_required(task_id).await?;
        parent.subtask_ids = child_ids;
        let parent = self.tasks.update(parent).await?;

        let description = plan_summary_markdown(&parent, &plan);
        self.checkpoints
            .create(
                task_id,
                &format!("Review plan: {}", parent.title),
                &description,
                CheckpointSource::Pm,
            )
            .await?;
        info!(
            "PM plan for {} accepted: {} sub-task(s), awaiting approval",
            task_id,
            plan.subtasks.len()
        );
        Ok(())
    }

    /// Materialise PM sub-plans as PLANNED child tasks.
    ///
    /// Dependency wiring differs by mode: sequential chains every child
    /// to its predecessor; parallel maps the PM's 0-based indices onto
    /// sibling ids.
    async fn create_subtasks(&self, parent: &Task, plan: &PmPlan) -> Result<Vec<String>> {
        let sequential = self.settings.dispatch_mode == crate::config::DispatchMode::Sequential;

        let mut child_ids: Vec<String> = Vec::with_capacity(plan.subtasks.len());
        for (i, sub) in plan.subtasks.iter().enumerate() {
            let mut child = Task::new(&sub.title, &sub.description);
            child.parent_id = Some(parent.id.clone());
            child.project = parent.project.clone();
            child.created_by = "pm".to_string();
            child.acceptance_criteria = sub.acceptance_criteria.clone();
            child
                .agent_outputs
                .insert("estimated_complexity".into(), sub.estimated_complexity.clone());

            child.depends_on = if sequential {
                // One at a time anyway; the chain makes the ordering explicit.
                child_ids.last().cloned().into_iter().collect()
            } else {
                sub.depends_on
                    .iter()
                    .filter_map(|&idx| child_ids.get(idx).cloned())
                    .collect()
            };

            let child = self.tasks.create(child).await?;
            self.tasks
                .update_status(&child.id, TaskStatus::Planned, "pm", &format!("sub-task {i} of plan"))
                .await?;
            child_ids.push(child.id);
        }
        Ok(child_ids)
    }

    // ---- Architect -----------------------------------------------------

    async fn handle_architect_complete(&self, task_id: &str, output: &str) -> Result<()> {
        let parent = self.tasks.get_required(task_id).await?;
        if parent.status != TaskStatus::Active {
            debug!("Architect complete for {} in {:?}; no-op", task_id, parent.status);
            return Ok(());
        }

        self.store_output(task_id, "architect", output).await?;

        // The design is advisory: an unparseable one still gets a
        // checkpoint so the user sees what happened.
        let description = match parse_architect_output(output) {
            Some(design) => design.guidance_markdown(),
            None => "(architect output could not be parsed)".to_string(),
        };

        self.checkpoints
            .create(
                task_id,
                &format!("Review design: {}", parent.title),
                &description,
                CheckpointSource::Architect,
            )
            .await?;
        Ok(())
    }

    // ---- Dev -----------------------------------------------------------

    async fn handle_dev_complete(&self, task_id: &str, output: &str) -> Result<()> {
        let task = self.tasks.get_required(task_id).await?;
        if task.status != TaskStatus::Active {
            debug!("Dev complete for {} in {:?}; no-op", task_id, task.status);
            return Ok(());
        }

        self.store_output(task_id, "dev", output).await?;
        self.commit_task_changes(&task, &format!("legatus: {} ({})", task.title, task.id))
            .await;

        let is_subtask = task.is_subtask();
        if self.settings.reviewer_for(is_subtask) {
            self.tasks
                .update_status(task_id, TaskStatus::Review, "agent", "dev complete")
                .await?;
            if self.spawn_gate(task_id, AgentRole::Reviewer).await {
                return Ok(());
            }
            // Reviewer could not start; reviews are advisory enough to
            // auto-approve rather than stall the campaign.
            warn!("Reviewer spawn failed for {}; auto-approving", task_id);
            self.route_review_approval(task_id, is_subtask).await?;
            return Ok(());
        }

        if self.settings.qa_for(is_subtask) {
            self.tasks
                .update_status(task_id, TaskStatus::Testing, "agent", "dev complete")
                .await?;
            if self.spawn_gate(task_id, AgentRole::Qa).await {
                return Ok(());
            }
            warn!("QA spawn failed for {}; auto-passing", task_id);
            self.tasks
                .update_status(task_id, TaskStatus::Done, "orchestrator", "qa spawn failed, auto-pass")
                .await?;
            self.after_task_done(task_id).await;
            return Ok(());
        }

        self.tasks
            .update_status(task_id, TaskStatus::Review, "agent", "dev complete")
            .await?;
        self.tasks
            .update_status(task_id, TaskStatus::Done, "orchestrator", "no gates configured")
            .await?;
        self.after_task_done(task_id).await;
        Ok(())
    }

    // ---- Reviewer ------------------------------------------------------

    async fn handle_reviewer_complete(&self, task_id: &str, output: &str) -> Result<()> {
        let task = self.tasks.get_required(task_id).await?;
        if task.status != TaskStatus::Review {
            debug!("Reviewer complete for {} in {:?}; no-op", task_id, task.status);
            return Ok(());
        }

        self.store_output(task_id, "reviewer", output).await?;

        // Unparseable reviews approve: the human still gates downstream.
        let review = parse_reviewer_output(output);
        let is_subtask = task.is_subtask();

        if let Some(review) = &review {
            if !review.security_concerns.is_empty() {
                let description = format!(
                    "Security concerns raised (verdict: {}):\n\n{}\n\n{}",
                    review.verdict,
                    review
                        .security_concerns
                        .iter()
                        .map(|c| format!("- {c}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    review.findings_markdown(),
                );
                self.create_checkpoint_on(
                    task_id,
                    &format!("Security review: {}", task.title),
                    &description,
                    CheckpointSource::Reviewer,
                )
                .await?;
                return Ok(());
            }
        }

        let review = match review {
            Some(review) if !review.approved() => review,
            // approve, or nothing parseable: let the human catch it downstream
            _ => return self.route_review_approval(task_id, is_subtask).await,
        };

        let retries = task.retry_count("reviewer_retry_count");
        if retries < self.settings.agent.reviewer_max_retries {
            info!(
                "Reviewer rejected {} (attempt {}); retrying dev",
                task_id,
                retries + 1
            );
            let mut task = self.tasks.get_required(task_id).await?;
            task.set_retry_count("reviewer_retry_count", retries + 1);
            task.agent_outputs
                .insert("reviewer_feedback".into(), review.summary.clone());
            self.tasks.update(task).await?;

            self.tasks
                .update_status(task_id, TaskStatus::Rejected, "reviewer", &review.summary)
                .await?;
            self.tasks
                .update_status(task_id, TaskStatus::Planned, "orchestrator", "reviewer retry")
                .await?;
            self.dispatcher.dispatch_single(task_id).await?;
            return Ok(());
        }

        info!("Reviewer retries exhausted for {}; escalating", task_id);
        self.create_checkpoint_on(
            task_id,
            &format!("Review rejected: {}", task.title),
            &review.findings_markdown(),
            CheckpointSource::Reviewer,
        )
        .await?;
        Ok(())
    }

    /// Shared approval routing for the reviewer gate (verdict approve,
    /// unparseable output, reviewer spawn failure, or a user overriding a
    /// reviewer checkpoint). Entered with the task in REVIEW (gate path)
    /// or ACTIVE (checkpoint path).
    pub(crate) async fn route_review_approval(&self, task_id: &str, is_subtask: bool) -> Result<()> {
        if self.settings.qa_for(is_subtask) {
            self.tasks
                .update_status(task_id, TaskStatus::Testing, "reviewer", "review approved")
                .await?;
            if !self.spawn_gate(task_id, AgentRole::Qa).await {
                warn!("QA spawn failed for {}; auto-passing", task_id);
                self.tasks
                    .update_status(task_id, TaskStatus::Done, "orchestrator", "qa spawn failed, auto-pass")
                    .await?;
                Box::pin(self.after_task_done(task_id)).await;
            }
            return Ok(());
        }

        let task = self.tasks.get_required(task_id).await?;
        if task.status == TaskStatus::Active {
            self.tasks
                .update_status(task_id, TaskStatus::Review, "reviewer", "review approved")
                .await?;
        }
        self.tasks
            .update_status(task_id, TaskStatus::Done, "reviewer", "review approved")
            .await?;
        Box::pin(self.after_task_done(task_id)).await;
        Ok(())
    }

    // ---- QA ------------------------------------------------------------

    async fn handle_qa_complete(&self, task_id: &str, output: &str) -> Result<()> {
        let task = self.tasks.get_required(task_id).await?;
        if task.status != TaskStatus::Testing {
            debug!("QA complete for {} in {:?}; no-op", task_id, task.status);
            return Ok(());
        }

        self.store_output(task_id, "qa", output).await?;
        // QA writes test files; keep them.
        self.commit_task_changes(&task, &format!("legatus: tests for {} ({})", task.title, task.id))
            .await;

        // Unparseable QA output passes: conservative, the human catches
        // it downstream.
        let qa = match parse_qa_output(output) {
            Some(qa) if !qa.passed() => qa,
            _ => {
                self.tasks
                    .update_status(task_id, TaskStatus::Done, "qa", "tests passed")
                    .await?;
                self.after_task_done(task_id).await;
                return Ok(());
            }
        };

        let retries = task.retry_count("qa_retry_count");
        if retries < self.settings.agent.qa_max_retries {
            info!("QA failed {} (attempt {}); retrying dev", task_id, retries + 1);
            let mut task = self.tasks.get_required(task_id).await?;
            task.set_retry_count("qa_retry_count", retries + 1);
            task.agent_outputs
                .insert("qa_feedback".into(), qa.summary.clone());
            self.tasks.update(task).await?;

            self.tasks
                .update_status(task_id, TaskStatus::Rejected, "qa", &qa.summary)
                .await?;
            self.tasks
                .update_status(task_id, TaskStatus::Planned, "orchestrator", "qa retry")
                .await?;
            self.dispatcher.dispatch_single(task_id).await?;
            return Ok(());
        }

        info!("QA retries exhausted for {}; escalating", task_id);
        self.create_checkpoint_on(
            task_id,
            &format!("QA failed: {}", task.title),
            &qa.report_markdown(),
            CheckpointSource::Qa,
        )
        .await?;
        Ok(())
    }

    // ---- Shared --------------------------------------------------------

    /// Commit whatever the agent left behind, in the task's worktree if
    /// it has one, else in the main workspace. Best-effort, never fatal.
    pub(crate) async fn commit_task_changes(&self, task: &Task, message: &str) {
        let git = self.git.lock().await;
        let result = if task.branch_name.is_some() {
            let worktree = self.dispatcher.worktree_path(&task.id);
            git.commit_in_worktree(&worktree, message).await
        } else {
            git.commit_changes(message).await
        };
        match result {
            Ok(Some(hash)) => info!("Git commit: {}", hash),
            Ok(None) => debug!("No changes to commit for {}", task.id),
            Err(e) => warn!("Commit failed for {}: {}", task.id, e),
        }
    }

    /// Spawn a reviewer/QA agent against the task's workspace. Returns
    /// false on spawn failure (callers decide the fallback).
    pub(crate) async fn spawn_gate(&self, task_id: &str, role: AgentRole) -> bool {
        let task = match self.tasks.get_required(task_id).await {
            Ok(task) => task,
            Err(e) => {
                error!("Cannot spawn {} agent: {}", role, e);
                return false;
            }
        };
        let worktree = task
            .branch_name
            .as_ref()
            .map(|_| self.dispatcher.worktree_path(&task.id))
            .filter(|path| path.exists());

        match self
            .spawner
            .spawn_agent(&task, role, worktree.as_deref())
            .await
        {
            Ok(record) => {
                if let Err(e) = self.state.set_agent(&record).await {
                    warn!("Could not persist agent record {}: {}", record.id, e);
                }
                info!("Spawned {} agent {} for {}", role, record.id, task_id);
                true
            }
            Err(e) => {
                error!("Failed to spawn {} agent for {}: {}", role, task_id, e);
                false
            }
        }
    }

    /// A task hit DONE: merge its branch (parallel mode) and advance the
    /// campaign.
    pub(crate) async fn after_task_done(&self, task_id: &str) {
        let task = match self.tasks.get(task_id).await {
            Ok(Some(task)) => task,
            _ => return,
        };

        if task.branch_name.is_some() && task.is_subtask() {
            self.merge_subtask_branch(&task).await;
        }

        let Some(parent_id) = task.parent_id.clone() else {
            info!("Campaign {} fully done", task.id);
            return;
        };

        match self.dispatcher.on_subtask_complete(&parent_id).await {
            Ok(Some(SubtaskOutcome::AllDone)) => {
                if let Err(e) = self.finalize_campaign(&parent_id).await {
                    error!("Campaign finalisation failed for {}: {}", parent_id, e);
                }
            }
            Ok(Some(SubtaskOutcome::Failed)) | Ok(None) => {}
            Err(e) => error!("Subtask-complete evaluation failed for {}: {}", parent_id, e),
        }
    }
}

/// Human-readable plan summary shown on the PM checkpoint.
fn plan_summary_markdown(parent: &Task, plan: &PmPlan) -> String {
    let mut out = format!("## Plan for: {}\n", parent.title);
    if !plan.analysis.is_empty() {
        out.push_str(&format!("\n{}\n", plan.analysis));
    }
    out.push_str("\n### Sub-tasks\n");
    for (i, sub) in plan.subtasks.iter().enumerate() {
        out.push_str(&format!("{}. **{}**: {}", i + 1, sub.title, sub.description));
        if !sub.depends_on.is_empty() {
            let deps: Vec<String> = sub.depends_on.iter().map(|d| (d + 1).to_string()).collect();
            out.push_str(&format!(" _(after {})_", deps.join(", ")));
        }
        out.push('\n');
        for criterion in &sub.acceptance_criteria {
            out.push_str(&format!("   - [ ] {criterion}\n"));
        }
    }
    out
}
