//! Merge-and-cleanup for sub-task branches (parallel mode).

use super::router::MERGE_CONFLICT_TASK_KEY;
use super::EventBus;
use crate::models::{CheckpointSource, Task};
use tracing::{error, info, warn};

/// Files the merge may resolve on its own by taking the incoming side.
/// The list is closed: generated artifacts only, never source. Anything
/// else escalates to a human.
fn is_auto_resolvable(path: &str) -> bool {
    const DIR_PREFIXES: [&str; 6] = [
        "htmlcov/",
        "__pycache__/",
        "dist/",
        "build/",
        "node_modules/",
        ".pytest_cache/",
    ];
    const EXACT_NAMES: [&str; 7] = [
        ".coverage",
        ".DS_Store",
        "coverage.xml",
        "package-lock.json",
        "poetry.lock",
        "uv.lock",
        "Cargo.lock",
    ];

    if DIR_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix) || path.contains(&format!("/{prefix}")))
    {
        return true;
    }

    let name = path.rsplit('/').next().unwrap_or(path);
    if EXACT_NAMES.contains(&name) {
        return true;
    }

    name.ends_with(".log") || name.ends_with(".pyc")
}

impl EventBus {
    /// Merge a finished sub-task's branch into the campaign working
    /// branch, per the protocol:
    ///
    /// 1. clean merge: drop worktree and branch;
    /// 2. conflicts only on generated artifacts: take incoming, commit,
    ///    clean up;
    /// 3. real conflicts: abort, checkpoint on the campaign, leave the
    ///    branch for the human;
    /// 4. non-conflict failure: keep the branch for manual recovery.
    pub(crate) async fn merge_subtask_branch(&self, task: &Task) {
        let Some(branch) = task.branch_name.clone() else {
            return;
        };
        let message = format!("legatus: merge {} ({})", task.title, task.id);

        let merge = {
            let git = self.git.lock().await;
            git.merge_branch(&branch, &message).await
        };

        match merge {
            Ok(result) if result.success => {
                info!("Merged {} cleanly", branch);
                self.cleanup_worktree_and_branch(task).await;
            }
            Ok(result) => {
                self.handle_merge_conflict(task, &branch, result.conflict_files)
                    .await;
            }
            Err(e) => {
                // Keep the branch so the work is recoverable by hand;
                // only the worktree goes.
                error!("Merge of {} failed without conflicts: {}", branch, e);
                let worktree = self.dispatcher.worktree_path(&task.id);
                let git = self.git.lock().await;
                if let Err(e) = git.remove_worktree(&worktree).await {
                    warn!("Worktree cleanup failed for {}: {}", task.id, e);
                }
            }
        }
    }

    async fn handle_merge_conflict(&self, task: &Task, branch: &str, conflict_files: Vec<String>) {
        if conflict_files.iter().all(|f| is_auto_resolvable(f)) {
            info!(
                "Auto-resolving merge of {} ({} generated file(s))",
                branch,
                conflict_files.len()
            );
            let resolved = {
                let git = self.git.lock().await;
                match git.resolve_conflicts_theirs(&conflict_files).await {
                    Ok(()) => git
                        .commit_merge_resolution(&format!(
                            "legatus: merge {} (auto-resolved artifacts)",
                            task.id
                        ))
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            };
            match resolved {
                Ok(()) => {
                    self.cleanup_worktree_and_branch(task).await;
                    return;
                }
                Err(e) => {
                    error!("Auto-resolution of {} failed: {}", branch, e);
                    // Fall through to the escalation path.
                }
            }
        }

        // Real conflict: abort, then pause the campaign on a checkpoint.
        {
            let git = self.git.lock().await;
            if let Err(e) = git.abort_merge().await {
                warn!("Merge abort failed for {}: {}", branch, e);
            }
        }

        let Some(parent_id) = task.parent_id.clone() else {
            error!("Merge conflict on campaign-less task {}; branch kept", task.id);
            return;
        };

        // Remember which sub-task the pending resolution belongs to.
        if let Ok(mut parent) = self.tasks.get_required(&parent_id).await {
            parent
                .agent_outputs
                .insert(MERGE_CONFLICT_TASK_KEY.to_string(), task.id.clone());
            if let Err(e) = self.tasks.update(parent).await {
                warn!("Could not record conflict task on {}: {}", parent_id, e);
            }
        }

        let file_list = conflict_files
            .iter()
            .map(|f| format!("- `{f}`"))
            .collect::<Vec<_>>()
            .join("\n");
        let description = format!(
            "Merging `{branch}` hit conflicts in:\n\n{file_list}\n\n\
             Resolve the conflicts in the workspace, then approve to commit \
             the resolution. Rejecting discards the branch's work.",
        );

        match self
            .create_checkpoint_on(
                &parent_id,
                &format!("Merge conflict: {}", task.title),
                &description,
                CheckpointSource::MergeConflict,
            )
            .await
        {
            Ok(cp) => info!("Created merge_conflict checkpoint {} on {}", cp.id, parent_id),
            Err(e) => {
                error!("Could not create merge_conflict checkpoint: {}", e);
                self.cascade_fail_parent(&parent_id, "merge conflict could not be escalated")
                    .await;
            }
        }
    }

    /// Drop a sub-task's worktree and branch. Each step swallows its own
    /// error so a failure in one never leaks the other.
    pub(crate) async fn cleanup_worktree_and_branch(&self, task: &Task) {
        let worktree = self.dispatcher.worktree_path(&task.id);
        let git = self.git.lock().await;
        if let Err(e) = git.remove_worktree(&worktree).await {
            warn!("Worktree cleanup failed for {}: {}", task.id, e);
        }
        if let Some(branch) = &task.branch_name {
            if let Err(e) = git.delete_branch(branch).await {
                warn!("Branch cleanup failed for {}: {}", branch, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::is_auto_resolvable;

    #[test]
    fn generated_artifacts_are_auto_resolvable() {
        for path in [
            ".coverage",
            "htmlcov/x",
            "__pycache__/m.pyc",
            "dist/out.tar",
            ".DS_Store",
            "x.log",
            "sub/dir/.DS_Store",
            "app/__pycache__/mod.pyc",
            "package-lock.json",
        ] {
            assert!(is_auto_resolvable(path), "{path} should auto-resolve");
        }
    }

    #[test]
    fn source_files_are_never_auto_resolvable() {
        for path in [
            "src/main.py",
            "README.md",
            "logger.rs",
            "distribution.md",
            "src/coverage_report.py",
        ] {
            assert!(!is_auto_resolvable(path), "{path} must escalate");
        }
    }
}
