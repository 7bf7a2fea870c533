//! Sub-task dispatch.
//!
//! Turns "this campaign has planned sub-tasks" into "dev agents are
//! running in the right number of workspaces". Sequential mode runs one
//! dev agent at a time against the shared workspace; parallel mode gives
//! every ready sub-task its own worktree and branch.

use crate::config::{DispatchMode, Settings};
use crate::git::GitOps;
use crate::models::{AgentRole, Task, TaskStatus};
use crate::parsers::parse_architect_output;
use crate::spawner::AgentSpawner;
use crate::store::{StateStore, TaskStore};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Marker used to keep the architecture appendix idempotent across
/// retries; a description containing it is never appended to again.
const GUIDANCE_MARKER: &str = "## Architecture Guidance";

/// agent_outputs key on a campaign listing sub-task ids the user chose
/// to skip after an agent failure (comma-separated). A REJECTED child in
/// this set counts as settled, not failed.
pub const SKIPPED_SUBTASKS_KEY: &str = "_skipped_subtasks";

/// What `on_subtask_complete` concluded about the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskOutcome {
    /// Every sub-task is DONE.
    AllDone,
    /// Nothing is running and at least one sub-task is REJECTED; the
    /// parent has been failed.
    Failed,
}

pub struct TaskDispatcher {
    settings: Settings,
    tasks: TaskStore,
    state: StateStore,
    spawner: Arc<AgentSpawner>,
    git: Arc<Mutex<GitOps>>,
}

impl TaskDispatcher {
    pub fn new(
        settings: Settings,
        tasks: TaskStore,
        state: StateStore,
        spawner: Arc<AgentSpawner>,
        git: Arc<Mutex<GitOps>>,
    ) -> Self {
        Self {
            settings,
            tasks,
            state,
            spawner,
            git,
        }
    }

    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.settings.worktree_base.join(format!("task-{task_id}"))
    }

    pub fn task_branch(&self, task: &Task) -> String {
        format!(
            "{}/task-{}",
            task.project.as_deref().unwrap_or("legatus"),
            task.id
        )
    }

    /// Sequential mode: dispatch the first PLANNED child whose
    /// dependencies are all DONE. At most one dev agent per campaign.
    ///
    /// Returns true if a child was dispatched.
    pub async fn dispatch_next(&self, parent_id: &str) -> Result<bool> {
        if self.state.is_paused().await? {
            debug!("Dispatch suppressed: system paused");
            return Ok(false);
        }

        let parent = match self.tasks.get(parent_id).await? {
            Some(parent) => parent,
            None => {
                error!("Parent task {} not found", parent_id);
                return Ok(false);
            }
        };

        for child_id in &parent.subtask_ids {
            let child = match self.tasks.get(child_id).await? {
                Some(child) if child.status == TaskStatus::Planned => child,
                _ => continue,
            };
            if !self.tasks.deps_satisfied(&child).await? {
                continue;
            }

            if self.spawn_dev(&parent, child, None).await? {
                return Ok(true);
            }
            // Spawn failed; the child was walked to REJECTED. Try the next.
        }

        Ok(false)
    }

    /// Parallel mode: dispatch every PLANNED child with satisfied
    /// dependencies, each into its own worktree on its own branch.
    ///
    /// Returns the number of children dispatched.
    pub async fn dispatch_all_ready(&self, parent_id: &str) -> Result<usize> {
        if self.state.is_paused().await? {
            debug!("Dispatch suppressed: system paused");
            return Ok(0);
        }

        let parent = match self.tasks.get(parent_id).await? {
            Some(parent) => parent,
            None => {
                error!("Parent task {} not found", parent_id);
                return Ok(0);
            }
        };

        let mut dispatched = 0;
        for child_id in &parent.subtask_ids {
            let mut child = match self.tasks.get(child_id).await? {
                Some(child) if child.status == TaskStatus::Planned => child,
                _ => continue,
            };
            if !self.tasks.deps_satisfied(&child).await? {
                continue;
            }

            let branch = self.task_branch(&child);
            let worktree = self.worktree_path(&child.id);
            {
                let git = self.git.lock().await;
                if let Err(e) = git.create_worktree(&worktree, &branch).await {
                    error!("Failed to create worktree for {}: {}", child.id, e);
                    self.fail_planned_child(&child.id, &format!("worktree failed: {e}"))
                        .await;
                    continue;
                }
            }

            child.branch_name = Some(branch.clone());
            let child = self.tasks.update(child).await?;

            if self.spawn_dev(&parent, child, Some(worktree.clone())).await? {
                dispatched += 1;
            } else {
                // Spawn failed: drop the now-orphaned worktree and branch.
                let git = self.git.lock().await;
                if let Err(e) = git.remove_worktree(&worktree).await {
                    warn!("Cleanup of worktree {} failed: {}", worktree.display(), e);
                }
                if let Err(e) = git.delete_branch(&branch).await {
                    warn!("Cleanup of branch {} failed: {}", branch, e);
                }
            }
        }

        Ok(dispatched)
    }

    /// Re-dispatch a dev agent against an existing task (reviewer/QA
    /// retry path). Reuses the task's worktree when it has one.
    pub async fn dispatch_single(&self, task_id: &str) -> Result<bool> {
        let task = self.tasks.get_required(task_id).await?;

        let parent = match &task.parent_id {
            Some(parent_id) => self.tasks.get(parent_id).await?,
            None => None,
        };

        let workspace = task
            .branch_name
            .as_ref()
            .map(|_| self.worktree_path(&task.id))
            .filter(|path| path.exists());

        let mut task = task;
        if let Some(parent) = &parent {
            self.inject_guidance(parent, &mut task);
        }
        let task = self.tasks.update(task).await?;

        match self.spawner.spawn_agent(&task, AgentRole::Dev, workspace.as_deref()).await {
            Ok(agent) => {
                self.state.set_agent(&agent).await?;
                self.tasks
                    .update_status(&task.id, TaskStatus::Active, "orchestrator", "retry")
                    .await?;
                let mut task = self.tasks.get_required(&task.id).await?;
                task.assigned_to = Some(agent.id.clone());
                self.tasks.update(task).await?;
                info!("Re-dispatched task {} with agent {}", task_id, agent.id);
                Ok(true)
            }
            Err(e) => {
                error!("Failed to re-spawn dev agent for {}: {}", task_id, e);
                self.fail_planned_child(task_id, &format!("spawn failed: {e}"))
                    .await;
                Ok(false)
            }
        }
    }

    /// Called after a sub-task reaches a terminal state. Classifies the
    /// campaign and either reports an outcome or dispatches more work.
    pub async fn on_subtask_complete(&self, parent_id: &str) -> Result<Option<SubtaskOutcome>> {
        let parent = match self.tasks.get(parent_id).await? {
            Some(parent) => parent,
            None => return Ok(None),
        };

        // A pending checkpoint owns the campaign; resolution will
        // re-evaluate.
        if parent.status == TaskStatus::Blocked {
            return Ok(None);
        }

        let skipped: Vec<&str> = parent
            .agent_outputs
            .get(SKIPPED_SUBTASKS_KEY)
            .map(|s| s.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let mut all_done = !parent.subtask_ids.is_empty();
        let mut any_failed = false;
        let mut any_running = false;
        for child_id in &parent.subtask_ids {
            let child = match self.tasks.get(child_id).await? {
                Some(child) => child,
                None => continue,
            };
            match child.status {
                TaskStatus::Done => {}
                TaskStatus::Rejected if skipped.contains(&child.id.as_str()) => {
                    // Explicitly skipped by the user; settled, not failed.
                }
                TaskStatus::Rejected => {
                    any_failed = true;
                    all_done = false;
                }
                TaskStatus::Active
                | TaskStatus::Review
                | TaskStatus::Testing
                | TaskStatus::Blocked => {
                    any_running = true;
                    all_done = false;
                }
                TaskStatus::Created | TaskStatus::Planned => {
                    all_done = false;
                }
            }
        }

        if all_done {
            info!("All sub-tasks done for campaign {}", parent_id);
            return Ok(Some(SubtaskOutcome::AllDone));
        }

        if any_failed && !any_running {
            error!("Campaign {} failed: sub-task rejected", parent_id);
            if parent.status == TaskStatus::Active {
                self.tasks
                    .update_status(parent_id, TaskStatus::Review, "orchestrator", "sub-task failed")
                    .await?;
                self.tasks
                    .update_status(parent_id, TaskStatus::Rejected, "orchestrator", "sub-task failure")
                    .await?;
            }
            return Ok(Some(SubtaskOutcome::Failed));
        }

        // Work remains; keep the pipeline fed.
        match self.settings.dispatch_mode {
            DispatchMode::Parallel => {
                let n = self.dispatch_all_ready(parent_id).await?;
                debug!("Dispatched {} ready sub-task(s) for {}", n, parent_id);
            }
            DispatchMode::Sequential => {
                if !any_running && !self.dispatch_next(parent_id).await? {
                    debug!("No sub-task ready for {} (waiting on dependencies)", parent_id);
                }
            }
        }
        Ok(None)
    }

    /// Abandon the decomposition: walk every CREATED/PLANNED child
    /// through the legal transitions to REJECTED.
    pub async fn cleanup_subtasks(&self, parent_id: &str) -> Result<()> {
        let parent = match self.tasks.get(parent_id).await? {
            Some(parent) => parent,
            None => return Ok(()),
        };

        for child_id in &parent.subtask_ids {
            let child = match self.tasks.get(child_id).await? {
                Some(child) => child,
                None => continue,
            };
            if !matches!(child.status, TaskStatus::Created | TaskStatus::Planned) {
                continue;
            }
            if child.status == TaskStatus::Created {
                self.tasks
                    .update_status(child_id, TaskStatus::Planned, "orchestrator", "plan rejected")
                    .await?;
            }
            for status in [TaskStatus::Active, TaskStatus::Review, TaskStatus::Rejected] {
                self.tasks
                    .update_status(child_id, status, "orchestrator", "parent plan rejected by user")
                    .await?;
            }
        }
        Ok(())
    }

    /// Append the architect's design appendix to a child description.
    /// Idempotent: a description already carrying the appendix is left
    /// alone. Returns true if the description changed.
    fn inject_guidance(&self, parent: &Task, child: &mut Task) -> bool {
        if child.description.contains(GUIDANCE_MARKER) {
            return false;
        }
        let Some(raw) = parent.agent_outputs.get("architect") else {
            return false;
        };
        let Some(design) = parse_architect_output(raw) else {
            return false;
        };
        child.description.push_str(&design.guidance_markdown());
        true
    }

    /// Spawn a dev agent for `child`, persist the record, and activate
    /// the task. On failure the child is walked PLANNED -> ... ->
    /// REJECTED with a spawn-failure detail. Returns whether the spawn
    /// succeeded.
    async fn spawn_dev(
        &self,
        parent: &Task,
        mut child: Task,
        worktree: Option<PathBuf>,
    ) -> Result<bool> {
        if self.inject_guidance(parent, &mut child) {
            child = self.tasks.update(child).await?;
        }

        match self
            .spawner
            .spawn_agent(&child, AgentRole::Dev, worktree.as_deref())
            .await
        {
            Ok(agent) => {
                self.state.set_agent(&agent).await?;
                self.tasks
                    .update_status(
                        &child.id,
                        TaskStatus::Active,
                        "orchestrator",
                        &format!("agent={}", agent.id),
                    )
                    .await?;
                let mut child = self.tasks.get_required(&child.id).await?;
                child.assigned_to = Some(agent.id.clone());
                self.tasks.update(child).await?;
                info!("Dispatched sub-task with agent {}", agent.id);
                Ok(true)
            }
            Err(e) => {
                error!("Failed to spawn dev agent for sub-task {}: {}", child.id, e);
                self.fail_planned_child(&child.id, &format!("spawn failed: {e}"))
                    .await;
                Ok(false)
            }
        }
    }

    /// Walk a PLANNED child to REJECTED through legal transitions.
    /// Best-effort: store failures here are logged, not propagated, so a
    /// dispatch sweep never dies halfway.
    async fn fail_planned_child(&self, child_id: &str, detail: &str) {
        for status in [TaskStatus::Active, TaskStatus::Review, TaskStatus::Rejected] {
            if let Err(e) = self
                .tasks
                .update_status(child_id, status, "orchestrator", detail)
                .await
            {
                warn!("Could not fail child {}: {}", child_id, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::runtime::fake::StaticRuntime;
    use crate::store::{MemoryBackend, Store};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        dispatcher: TaskDispatcher,
        tasks: TaskStore,
        state: StateStore,
        runtime: Arc<StaticRuntime>,
    }

    async fn fixture(mode: DispatchMode) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::test_settings(dir.path());
        settings.dispatch_mode = mode;

        let backend: Store = Arc::new(MemoryBackend::new());
        let tasks = TaskStore::new(backend.clone());
        let state = StateStore::new(backend);
        let runtime = Arc::new(StaticRuntime::new());
        let spawner = Arc::new(AgentSpawner::new(settings.clone(), runtime.clone()));
        let git = GitOps::new(dir.path());
        git.init_repo().await.unwrap();

        let dispatcher = TaskDispatcher::new(
            settings,
            tasks.clone(),
            state.clone(),
            spawner,
            Arc::new(Mutex::new(git)),
        );

        Fixture {
            _dir: dir,
            dispatcher,
            tasks,
            state,
            runtime,
        }
    }

    async fn campaign_with_children(f: &Fixture, n: usize) -> (Task, Vec<String>) {
        let mut parent = Task::new("campaign", "do things");
        parent.project = Some("demo".into());
        let mut child_ids = Vec::new();
        for i in 0..n {
            let mut child = Task::new(format!("child {i}"), format!("work {i}"));
            child.parent_id = Some(parent.id.clone());
            child.project = parent.project.clone();
            let child = f.tasks.create(child).await.unwrap();
            f.tasks
                .update_status(&child.id, TaskStatus::Planned, "test", "")
                .await
                .unwrap();
            child_ids.push(child.id);
        }
        parent.subtask_ids = child_ids.clone();
        let parent = f.tasks.create(parent).await.unwrap();
        f.tasks
            .update_status(&parent.id, TaskStatus::Planned, "test", "")
            .await
            .unwrap();
        let parent = f
            .tasks
            .update_status(&parent.id, TaskStatus::Active, "test", "")
            .await
            .unwrap();
        (parent, child_ids)
    }

    #[tokio::test]
    async fn sequential_dispatches_one_at_a_time() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, children) = campaign_with_children(&f, 2).await;

        assert!(f.dispatcher.dispatch_next(&parent.id).await.unwrap());
        assert_eq!(f.runtime.spawned(), 1);

        let first = f.tasks.get(&children[0]).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Active);
        assert!(first.assigned_to.is_some());
        // No worktree, no branch in sequential mode
        assert!(first.branch_name.is_none());

        let second = f.tasks.get(&children[1]).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Planned);
    }

    #[tokio::test]
    async fn sequential_respects_dependencies() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, children) = campaign_with_children(&f, 2).await;

        // Second child depends on the first, first not DONE yet; child
        // iteration order still picks the first.
        let mut second = f.tasks.get(&children[1]).await.unwrap().unwrap();
        second.depends_on = vec![children[0].clone()];
        f.tasks.update(second).await.unwrap();

        assert!(f.dispatcher.dispatch_next(&parent.id).await.unwrap());
        let first = f.tasks.get(&children[0]).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn parallel_gives_each_child_a_worktree() {
        let f = fixture(DispatchMode::Parallel).await;
        let (parent, children) = campaign_with_children(&f, 2).await;

        let n = f.dispatcher.dispatch_all_ready(&parent.id).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(f.runtime.spawned(), 2);

        for child_id in &children {
            let child = f.tasks.get(child_id).await.unwrap().unwrap();
            assert_eq!(child.status, TaskStatus::Active);
            assert_eq!(
                child.branch_name.as_deref(),
                Some(format!("demo/task-{child_id}").as_str())
            );
            assert!(f.dispatcher.worktree_path(child_id).exists());
        }

        // Both agents were given the worktree mount, not the workspace
        let specs = f.runtime.specs.lock().unwrap();
        for spec in specs.iter() {
            assert!(spec.volumes[0].0.contains(".legatus-worktrees/task-"));
        }
    }

    #[tokio::test]
    async fn spawn_failure_rejects_child_and_cleans_worktree() {
        let f = fixture(DispatchMode::Parallel).await;
        let (parent, children) = campaign_with_children(&f, 1).await;

        f.runtime.fail_next.store(true, Ordering::SeqCst);
        let n = f.dispatcher.dispatch_all_ready(&parent.id).await.unwrap();
        assert_eq!(n, 0);

        let child = f.tasks.get(&children[0]).await.unwrap().unwrap();
        assert_eq!(child.status, TaskStatus::Rejected);
        let detail = child.history.last().unwrap().detail.clone().unwrap();
        assert!(detail.contains("spawn failed"));
        assert!(!f.dispatcher.worktree_path(&children[0]).exists());
    }

    #[tokio::test]
    async fn paused_flag_suppresses_dispatch() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, _children) = campaign_with_children(&f, 1).await;

        f.state.set_paused(true).await.unwrap();
        assert!(!f.dispatcher.dispatch_next(&parent.id).await.unwrap());
        assert_eq!(f.runtime.spawned(), 0);

        f.state.set_paused(false).await.unwrap();
        assert!(f.dispatcher.dispatch_next(&parent.id).await.unwrap());
    }

    #[tokio::test]
    async fn architect_guidance_is_appended_once() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, children) = campaign_with_children(&f, 1).await;

        let mut parent_task = f.tasks.get(&parent.id).await.unwrap().unwrap();
        parent_task.agent_outputs.insert(
            "architect".into(),
            "```json\n{\"design_notes\": \"Use one binary\"}\n```".into(),
        );
        f.tasks.update(parent_task).await.unwrap();

        assert!(f.dispatcher.dispatch_next(&parent.id).await.unwrap());
        let child = f.tasks.get(&children[0]).await.unwrap().unwrap();
        assert!(child.description.contains("## Architecture Guidance"));
        assert!(child.description.contains("Use one binary"));

        // Retry path must not double-append
        for status in [TaskStatus::Review, TaskStatus::Rejected, TaskStatus::Planned] {
            f.tasks
                .update_status(&child.id, status, "test", "")
                .await
                .unwrap();
        }
        assert!(f.dispatcher.dispatch_single(&child.id).await.unwrap());
        let child = f.tasks.get(&child.id).await.unwrap().unwrap();
        assert_eq!(child.description.matches("## Architecture Guidance").count(), 1);
    }

    #[tokio::test]
    async fn on_subtask_complete_classifies_outcomes() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, children) = campaign_with_children(&f, 2).await;

        // One child running: no outcome, nothing new in sequential mode
        f.tasks
            .update_status(&children[0], TaskStatus::Active, "test", "")
            .await
            .unwrap();
        assert_eq!(
            f.dispatcher.on_subtask_complete(&parent.id).await.unwrap(),
            None
        );

        // First done -> second gets dispatched
        for status in [TaskStatus::Review, TaskStatus::Done] {
            f.tasks
                .update_status(&children[0], status, "test", "")
                .await
                .unwrap();
        }
        assert_eq!(
            f.dispatcher.on_subtask_complete(&parent.id).await.unwrap(),
            None
        );
        assert_eq!(
            f.tasks.get(&children[1]).await.unwrap().unwrap().status,
            TaskStatus::Active
        );

        // Second done -> all done
        for status in [TaskStatus::Review, TaskStatus::Done] {
            f.tasks
                .update_status(&children[1], status, "test", "")
                .await
                .unwrap();
        }
        assert_eq!(
            f.dispatcher.on_subtask_complete(&parent.id).await.unwrap(),
            Some(SubtaskOutcome::AllDone)
        );
    }

    #[tokio::test]
    async fn failed_child_fails_the_campaign_when_nothing_runs() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, children) = campaign_with_children(&f, 2).await;

        for status in [
            TaskStatus::Active,
            TaskStatus::Review,
            TaskStatus::Done,
        ] {
            f.tasks.update_status(&children[0], status, "test", "").await.unwrap();
        }
        for status in [
            TaskStatus::Active,
            TaskStatus::Review,
            TaskStatus::Rejected,
        ] {
            f.tasks.update_status(&children[1], status, "test", "").await.unwrap();
        }

        assert_eq!(
            f.dispatcher.on_subtask_complete(&parent.id).await.unwrap(),
            Some(SubtaskOutcome::Failed)
        );
        assert_eq!(
            f.tasks.get(&parent.id).await.unwrap().unwrap().status,
            TaskStatus::Rejected
        );
    }

    #[tokio::test]
    async fn blocked_parent_defers_to_its_checkpoint() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, _children) = campaign_with_children(&f, 1).await;
        f.tasks
            .update_status(&parent.id, TaskStatus::Blocked, "test", "")
            .await
            .unwrap();

        assert_eq!(
            f.dispatcher.on_subtask_complete(&parent.id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn cleanup_subtasks_rejects_pending_children() {
        let f = fixture(DispatchMode::Sequential).await;
        let (parent, children) = campaign_with_children(&f, 2).await;

        // One child already active stays untouched
        f.tasks
            .update_status(&children[0], TaskStatus::Active, "test", "")
            .await
            .unwrap();

        f.dispatcher.cleanup_subtasks(&parent.id).await.unwrap();

        assert_eq!(
            f.tasks.get(&children[0]).await.unwrap().unwrap().status,
            TaskStatus::Active
        );
        assert_eq!(
            f.tasks.get(&children[1]).await.unwrap().unwrap().status,
            TaskStatus::Rejected
        );
    }
}
