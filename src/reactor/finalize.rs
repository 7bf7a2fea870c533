//! Campaign start and finalisation.

use super::EventBus;
use crate::config::DispatchMode;
use crate::models::{AgentRole, TaskStatus};
use crate::Result;
use tracing::{error, info, warn};

/// agent_outputs key holding the branch that was checked out before the
/// campaign created its working branch.
pub(crate) const ORIGINAL_BRANCH_KEY: &str = "_original_branch";

impl EventBus {
    /// Kick off execution after the plan (and optional design) was
    /// approved: in parallel mode, save the original branch and move the
    /// workspace onto the campaign working branch first.
    pub(crate) async fn start_execution(&self, parent_id: &str) -> Result<()> {
        match self.settings.dispatch_mode {
            DispatchMode::Sequential => {
                self.dispatcher.dispatch_next(parent_id).await?;
            }
            DispatchMode::Parallel => {
                let parent = self.tasks.get_required(parent_id).await?;
                let campaign_branch = format!(
                    "{}/campaign-{}",
                    parent.project.as_deref().unwrap_or("legatus"),
                    parent.id
                );

                {
                    let git = self.git.lock().await;
                    let original = git.get_current_branch().await?;
                    git.ensure_working_branch(&campaign_branch).await?;

                    let mut parent = self.tasks.get_required(parent_id).await?;
                    parent
                        .agent_outputs
                        .entry(ORIGINAL_BRANCH_KEY.to_string())
                        .or_insert(original);
                    self.tasks.update(parent).await?;
                }

                self.dispatcher.dispatch_all_ready(parent_id).await?;
            }
        }
        Ok(())
    }

    /// All sub-tasks are DONE: merge the campaign branch back, then run
    /// the campaign-level gates (or finish outright).
    pub(crate) async fn finalize_campaign(&self, parent_id: &str) -> Result<()> {
        let parent = self.tasks.get_required(parent_id).await?;
        if parent.status != TaskStatus::Active {
            info!(
                "Campaign {} finalisation skipped in {:?}",
                parent_id, parent.status
            );
            return Ok(());
        }

        if self.settings.dispatch_mode == DispatchMode::Parallel {
            self.merge_campaign_branch(parent_id).await;
        }

        // Campaign-level gates see the union of all dev work.
        let reviewer = self.settings.reviewer_for(false);
        let qa = self.settings.qa_for(false);
        if reviewer || qa {
            self.aggregate_dev_outputs(parent_id).await?;
        }

        if reviewer {
            self.tasks
                .update_status(parent_id, TaskStatus::Review, "orchestrator", "campaign review")
                .await?;
            if !self.spawn_gate(parent_id, AgentRole::Reviewer).await {
                warn!("Campaign reviewer spawn failed; auto-approving");
                self.route_review_approval(parent_id, false).await?;
            }
            return Ok(());
        }

        if qa {
            self.tasks
                .update_status(parent_id, TaskStatus::Testing, "orchestrator", "campaign qa")
                .await?;
            if !self.spawn_gate(parent_id, AgentRole::Qa).await {
                warn!("Campaign QA spawn failed; auto-passing");
                self.tasks
                    .update_status(parent_id, TaskStatus::Done, "orchestrator", "qa spawn failed, auto-pass")
                    .await?;
            }
            return Ok(());
        }

        self.tasks
            .update_status(parent_id, TaskStatus::Review, "orchestrator", "all sub-tasks completed")
            .await?;
        self.tasks
            .update_status(parent_id, TaskStatus::Done, "orchestrator", "all sub-tasks done")
            .await?;
        info!("Campaign {} done", parent_id);
        Ok(())
    }

    /// Merge the campaign working branch back into the branch the user
    /// started from. On conflict both branches are preserved for manual
    /// resolution; the campaign is finished either way, so this logs
    /// rather than checkpoints.
    async fn merge_campaign_branch(&self, parent_id: &str) {
        let parent = match self.tasks.get_required(parent_id).await {
            Ok(parent) => parent,
            Err(e) => {
                error!("Cannot load campaign {} for merge: {}", parent_id, e);
                return;
            }
        };
        let Some(original) = parent.agent_outputs.get(ORIGINAL_BRANCH_KEY).cloned() else {
            return;
        };
        let campaign_branch = format!(
            "{}/campaign-{}",
            parent.project.as_deref().unwrap_or("legatus"),
            parent.id
        );

        let git = self.git.lock().await;
        if let Err(e) = git.checkout(&original).await {
            error!("Cannot checkout {} for campaign merge: {}", original, e);
            return;
        }

        match git
            .merge_branch(
                &campaign_branch,
                &format!("legatus: campaign {} ({})", parent.title, parent.id),
            )
            .await
        {
            Ok(result) if result.success => {
                info!("Campaign branch {} merged into {}", campaign_branch, original);
                if let Err(e) = git.delete_branch(&campaign_branch).await {
                    warn!("Could not delete campaign branch {}: {}", campaign_branch, e);
                }
            }
            Ok(result) => {
                // Both branches stay; the user resolves at leisure.
                error!(
                    "Campaign merge conflicted on {:?}; aborting, branches preserved",
                    result.conflict_files
                );
                if let Err(e) = git.abort_merge().await {
                    warn!("Abort of campaign merge failed: {}", e);
                }
            }
            Err(e) => {
                error!("Campaign merge failed: {}; branches preserved", e);
            }
        }
    }

    /// Concatenate all child dev outputs onto the parent under "dev" so
    /// a campaign-level gate agent sees the whole body of work.
    async fn aggregate_dev_outputs(&self, parent_id: &str) -> Result<()> {
        let parent = self.tasks.get_required(parent_id).await?;
        let mut sections = Vec::new();
        for child_id in &parent.subtask_ids {
            if let Some(child) = self.tasks.get(child_id).await? {
                if let Some(output) = child.agent_outputs.get("dev") {
                    sections.push(format!("## {} ({})\n\n{}", child.title, child.id, output));
                }
            }
        }
        if sections.is_empty() {
            return Ok(());
        }

        let mut parent = parent;
        parent.agent_outputs.insert("dev".into(), sections.join("\n\n---\n\n"));
        self.tasks.update(parent).await?;
        Ok(())
    }
}
