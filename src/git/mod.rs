//! Git operations on the orchestrator workspace.
//!
//! All commands use explicit argument arrays (no shell strings) and run
//! against a fixed workspace directory. Operations on the main workspace
//! must be serialised by the caller (the orchestrator holds the `GitOps`
//! behind a mutex); operations on distinct worktree paths may interleave.

use crate::{LegatusError, Result};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Outcome of a non-fast-forward merge.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub success: bool,
    pub commit_hash: Option<String>,
    pub conflict_files: Vec<String>,
}

pub struct GitOps {
    workspace: PathBuf,
}

impl GitOps {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| LegatusError::git(format!("failed to run git {}: {e}", args.join(" "))))?;
        Ok(output)
    }

    async fn run_ok(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LegatusError::git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    fn stdout_line(output: &Output) -> String {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Initialize the workspace repository. Idempotent.
    ///
    /// Configures identity, marks the directory safe for git when its
    /// ownership differs from the orchestrator user (common with container
    /// volume mounts), and guarantees at least one commit exists so
    /// worktrees can be created off HEAD.
    pub async fn init_repo(&self) -> Result<()> {
        // Container mounts often leave the workspace owned by another uid;
        // without this every git call fails with "dubious ownership".
        let _ = self
            .run(&[
                "config",
                "--global",
                "--add",
                "safe.directory",
                &self.workspace.to_string_lossy(),
            ])
            .await;

        let inside = self.run(&["rev-parse", "--is-inside-work-tree"]).await?;
        if !inside.status.success() {
            self.run_ok(&["init"]).await?;
            info!("Initialized git repo in {}", self.workspace.display());
        }

        self.run_ok(&["config", "user.email", "legatus@local"]).await?;
        self.run_ok(&["config", "user.name", "Legatus"]).await?;

        let head = self.run(&["rev-parse", "HEAD"]).await?;
        if !head.status.success() {
            self.run_ok(&["commit", "--allow-empty", "-m", "legatus: initial commit"])
                .await?;
            info!("Created initial commit in {}", self.workspace.display());
        }

        self.exclude_worktree_dir().await?;

        Ok(())
    }

    /// Keep the worktree base out of the main workspace's index. Worktrees
    /// live under `.legatus-worktrees/` inside the workspace; without this
    /// exclude, `git add -A` on the main workspace would record them as
    /// gitlinks and merges would drag sibling branches around.
    async fn exclude_worktree_dir(&self) -> Result<()> {
        const EXCLUDE_ENTRY: &str = ".legatus-worktrees/";

        let git_dir = Self::stdout_line(&self.run_ok(&["rev-parse", "--git-dir"]).await?);
        let mut exclude_path = PathBuf::from(&git_dir);
        if exclude_path.is_relative() {
            exclude_path = self.workspace.join(exclude_path);
        }
        let exclude_path = exclude_path.join("info").join("exclude");

        let current = tokio::fs::read_to_string(&exclude_path)
            .await
            .unwrap_or_default();
        if current.lines().any(|line| line.trim() == EXCLUDE_ENTRY) {
            return Ok(());
        }
        if let Some(parent) = exclude_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LegatusError::git(format!("cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&exclude_path, format!("{current}{EXCLUDE_ENTRY}\n"))
            .await
            .map_err(|e| LegatusError::git(format!("cannot write git exclude: {e}")))?;
        Ok(())
    }

    /// Stage everything and commit. Returns the commit hash, or None when
    /// there was nothing to commit.
    pub async fn commit_changes(&self, message: &str) -> Result<Option<String>> {
        self.run_ok(&["add", "-A"]).await?;

        let staged = self.run(&["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            debug!("No staged changes to commit");
            return Ok(None);
        }

        self.run_ok(&["commit", "-m", message]).await?;
        let hash = Self::stdout_line(&self.run_ok(&["rev-parse", "HEAD"]).await?);
        info!("Committed: {} ({})", message, &hash[..hash.len().min(8)]);
        Ok(Some(hash))
    }

    pub async fn get_current_branch(&self) -> Result<String> {
        let output = self.run_ok(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(Self::stdout_line(&output))
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run_ok(&["checkout", branch]).await?;
        Ok(())
    }

    /// Checkout `branch`, creating it off current HEAD if it does not
    /// exist. Calling this twice with the same branch is a no-op.
    pub async fn ensure_working_branch(&self, branch: &str) -> Result<()> {
        if self.get_current_branch().await? == branch {
            return Ok(());
        }
        let checkout = self.run(&["checkout", branch]).await?;
        if checkout.status.success() {
            return Ok(());
        }
        self.run_ok(&["checkout", "-b", branch]).await?;
        info!("Created working branch {}", branch);
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_ok(&["branch", "-D", branch]).await?;
        Ok(())
    }

    /// Create `branch` off current HEAD and materialise it at `path`.
    pub async fn create_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LegatusError::git(format!("cannot create {}: {e}", parent.display())))?;
        }
        self.run_ok(&["worktree", "add", "-b", branch, &path.to_string_lossy()])
            .await?;
        info!("Created worktree {} on branch {}", path.display(), branch);
        Ok(())
    }

    /// Forced removal plus prune, so a half-deleted worktree never blocks
    /// a later `worktree add` with the same name.
    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        self.run_ok(&["worktree", "remove", "--force", &path.to_string_lossy()])
            .await?;
        let _ = self.run(&["worktree", "prune"]).await;
        Ok(())
    }

    /// Commit all changes inside a specific worktree.
    ///
    /// Uses explicit --git-dir/--work-tree so the commit lands on the
    /// worktree's branch even when an agent ran `git init` inside the
    /// worktree and clobbered its `.git` pointer file.
    pub async fn commit_in_worktree(
        &self,
        worktree_path: &Path,
        message: &str,
    ) -> Result<Option<String>> {
        let name = worktree_path
            .file_name()
            .ok_or_else(|| LegatusError::git("worktree path has no basename"))?
            .to_string_lossy()
            .to_string();
        let git_dir = self.workspace.join(".git").join("worktrees").join(&name);
        if !git_dir.exists() {
            return Err(LegatusError::git(format!(
                "no worktree metadata at {}",
                git_dir.display()
            )));
        }

        let git_dir = git_dir.to_string_lossy().to_string();
        let work_tree = worktree_path.to_string_lossy().to_string();
        let base = ["--git-dir", git_dir.as_str(), "--work-tree", work_tree.as_str()];

        let run = |args: Vec<&str>| {
            let mut full: Vec<String> = base.iter().map(|s| s.to_string()).collect();
            full.extend(args.iter().map(|s| s.to_string()));
            async move {
                Command::new("git")
                    .args(&full)
                    .current_dir(worktree_path)
                    .output()
                    .await
                    .map_err(|e| LegatusError::git(format!("failed to run git in worktree: {e}")))
            }
        };

        let add = run(vec!["add", "-A"]).await?;
        if !add.status.success() {
            return Err(LegatusError::git(format!(
                "git add in worktree failed: {}",
                String::from_utf8_lossy(&add.stderr).trim()
            )));
        }

        let staged = run(vec!["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            debug!("No changes to commit in worktree {}", worktree_path.display());
            return Ok(None);
        }

        let commit = run(vec!["commit", "-m", message]).await?;
        if !commit.status.success() {
            return Err(LegatusError::git(format!(
                "git commit in worktree failed: {}",
                String::from_utf8_lossy(&commit.stderr).trim()
            )));
        }

        let head = run(vec!["rev-parse", "HEAD"]).await?;
        let hash = String::from_utf8_lossy(&head.stdout).trim().to_string();
        info!(
            "Committed in worktree {}: {}",
            worktree_path.display(),
            &hash[..hash.len().min(8)]
        );
        Ok(Some(hash))
    }

    /// Non-fast-forward merge of `source` into the current branch.
    ///
    /// On conflict the merge is left open for inspection or resolution;
    /// nothing is aborted here. A failure that produced no conflicted
    /// files is surfaced as an error.
    pub async fn merge_branch(&self, source: &str, message: &str) -> Result<MergeResult> {
        let merge = self.run(&["merge", "--no-ff", source, "-m", message]).await?;

        if merge.status.success() {
            let hash = Self::stdout_line(&self.run_ok(&["rev-parse", "HEAD"]).await?);
            return Ok(MergeResult {
                success: true,
                commit_hash: Some(hash),
                conflict_files: Vec::new(),
            });
        }

        let conflicts = self.get_conflict_files().await?;
        if conflicts.is_empty() {
            let stderr = String::from_utf8_lossy(&merge.stderr);
            return Err(LegatusError::git(format!(
                "merge of {source} failed without conflicts: {}",
                stderr.trim()
            )));
        }

        warn!("Merge of {} conflicted on {} file(s)", source, conflicts.len());
        Ok(MergeResult {
            success: false,
            commit_hash: None,
            conflict_files: conflicts,
        })
    }

    pub async fn get_conflict_files(&self) -> Result<Vec<String>> {
        let output = self
            .run_ok(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Take the incoming side for each conflicted file and stage it.
    pub async fn resolve_conflicts_theirs(&self, files: &[String]) -> Result<()> {
        for file in files {
            self.run_ok(&["checkout", "--theirs", "--", file]).await?;
            self.run_ok(&["add", "--", file]).await?;
        }
        Ok(())
    }

    /// Commit whatever resolution is staged/present in the working copy.
    pub async fn commit_merge_resolution(&self, message: &str) -> Result<String> {
        self.run_ok(&["add", "-A"]).await?;
        self.run_ok(&["commit", "-m", message]).await?;
        let hash = Self::stdout_line(&self.run_ok(&["rev-parse", "HEAD"]).await?);
        Ok(hash)
    }

    pub async fn abort_merge(&self) -> Result<()> {
        self.run_ok(&["merge", "--abort"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::fs;

    async fn repo() -> (TempDir, GitOps) {
        let dir = TempDir::new().unwrap();
        let git = GitOps::new(dir.path());
        git.init_repo().await.unwrap();
        (dir, git)
    }

    async fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.unwrap();
        }
        fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn init_is_idempotent_and_leaves_a_commit() {
        let (_dir, git) = repo().await;
        git.init_repo().await.unwrap();
        // HEAD resolves, so worktrees can be created immediately
        let branch = git.get_current_branch().await.unwrap();
        assert!(!branch.is_empty());
    }

    #[tokio::test]
    async fn main_workspace_commits_ignore_the_worktree_base() {
        let (dir, git) = repo().await;
        let wt = dir.path().join(".legatus-worktrees").join("task-7");
        fs::create_dir_all(wt.parent().unwrap()).await.unwrap();
        git.create_worktree(&wt, "demo/task-7").await.unwrap();
        write(&wt, "other-branch.txt", "isolated").await;

        // Nothing to commit on the main workspace despite the populated
        // worktree living inside it
        assert!(git.commit_changes("sweep").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_changes_returns_none_when_clean() {
        let (dir, git) = repo().await;
        assert!(git.commit_changes("nothing").await.unwrap().is_none());

        write(dir.path(), "a.txt", "hello").await;
        let hash = git.commit_changes("add a.txt").await.unwrap();
        assert!(hash.is_some());

        assert!(git.commit_changes("nothing again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_working_branch_is_idempotent() {
        let (_dir, git) = repo().await;
        git.ensure_working_branch("demo/campaign-1").await.unwrap();
        assert_eq!(git.get_current_branch().await.unwrap(), "demo/campaign-1");
        // Second call is a no-op
        git.ensure_working_branch("demo/campaign-1").await.unwrap();
        assert_eq!(git.get_current_branch().await.unwrap(), "demo/campaign-1");
    }

    #[tokio::test]
    async fn worktree_commit_lands_on_its_branch() {
        let (dir, git) = repo().await;
        let wt = dir.path().join("wt").join("task-1");
        fs::create_dir_all(wt.parent().unwrap()).await.unwrap();

        git.create_worktree(&wt, "demo/task-1").await.unwrap();
        write(&wt, "feature.txt", "work").await;
        let hash = git.commit_in_worktree(&wt, "task work").await.unwrap();
        assert!(hash.is_some());

        // The main workspace does not see the file until merge
        assert!(!dir.path().join("feature.txt").exists());

        let result = git.merge_branch("demo/task-1", "merge task-1").await.unwrap();
        assert!(result.success);
        assert!(dir.path().join("feature.txt").exists());

        git.remove_worktree(&wt).await.unwrap();
        git.delete_branch("demo/task-1").await.unwrap();
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn commit_in_worktree_survives_clobbered_pointer() {
        let (dir, git) = repo().await;
        let wt = dir.path().join("wt").join("task-2");
        fs::create_dir_all(wt.parent().unwrap()).await.unwrap();
        git.create_worktree(&wt, "demo/task-2").await.unwrap();

        // Simulate an agent running `git init` inside the worktree,
        // which replaces the `.git` pointer file with a real directory.
        fs::remove_file(wt.join(".git")).await.unwrap();
        tokio::process::Command::new("git")
            .args(["init"])
            .current_dir(&wt)
            .output()
            .await
            .unwrap();

        write(&wt, "feature.txt", "work").await;
        let hash = git.commit_in_worktree(&wt, "task work").await.unwrap();
        assert!(hash.is_some());

        let result = git.merge_branch("demo/task-2", "merge task-2").await.unwrap();
        assert!(result.success, "commit must land on demo/task-2, not a stray repo");
        assert!(dir.path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn merge_conflict_is_reported_and_resolvable_theirs() {
        let (dir, git) = repo().await;
        write(dir.path(), "shared.txt", "base\n").await;
        git.commit_changes("base").await.unwrap();

        let wt = dir.path().join("wt").join("task-3");
        fs::create_dir_all(wt.parent().unwrap()).await.unwrap();
        git.create_worktree(&wt, "demo/task-3").await.unwrap();

        // Diverge both sides
        write(&wt, "shared.txt", "theirs\n").await;
        git.commit_in_worktree(&wt, "their change").await.unwrap();
        write(dir.path(), "shared.txt", "ours\n").await;
        git.commit_changes("our change").await.unwrap();

        let result = git.merge_branch("demo/task-3", "merge task-3").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.conflict_files, vec!["shared.txt".to_string()]);
        assert_eq!(git.get_conflict_files().await.unwrap(), vec!["shared.txt"]);

        git.resolve_conflicts_theirs(&result.conflict_files)
            .await
            .unwrap();
        git.commit_merge_resolution("resolve with incoming").await.unwrap();

        let content = fs::read_to_string(dir.path().join("shared.txt")).await.unwrap();
        assert_eq!(content, "theirs\n");
    }

    #[tokio::test]
    async fn abort_merge_restores_clean_state() {
        let (dir, git) = repo().await;
        write(dir.path(), "shared.txt", "base\n").await;
        git.commit_changes("base").await.unwrap();

        let wt: PathBuf = dir.path().join("wt").join("task-4");
        fs::create_dir_all(wt.parent().unwrap()).await.unwrap();
        git.create_worktree(&wt, "demo/task-4").await.unwrap();
        write(&wt, "shared.txt", "theirs\n").await;
        git.commit_in_worktree(&wt, "their change").await.unwrap();
        write(dir.path(), "shared.txt", "ours\n").await;
        git.commit_changes("our change").await.unwrap();

        let result = git.merge_branch("demo/task-4", "merge").await.unwrap();
        assert!(!result.success);

        git.abort_merge().await.unwrap();
        assert!(git.get_conflict_files().await.unwrap().is_empty());
        let content = fs::read_to_string(dir.path().join("shared.txt")).await.unwrap();
        assert_eq!(content, "ours\n");
    }
}
