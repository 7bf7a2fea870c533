use crate::checkpoints::CheckpointManager;
use crate::config::{DispatchMode, ReviewMode, Settings};
use crate::dispatch::TaskDispatcher;
use crate::git::GitOps;
use crate::models::{
    AgentRecord, AgentRole, CheckpointSource, Message, MessageType, Task, TaskStatus,
};
use crate::reactor::EventBus;
use crate::spawner::runtime::fake::StaticRuntime;
use crate::spawner::AgentSpawner;
use crate::store::{CostStore, MemoryBackend, PubSub, StateStore, Store, TaskStore};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

struct Harness {
    dir: TempDir,
    tasks: TaskStore,
    state: StateStore,
    checkpoints: CheckpointManager,
    spawner: Arc<AgentSpawner>,
    dispatcher: Arc<TaskDispatcher>,
    bus: EventBus,
}

impl Harness {
    async fn new(configure: impl FnOnce(&mut Settings)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::test_settings(dir.path());
        configure(&mut settings);

        let backend: Store = Arc::new(MemoryBackend::new());
        let tasks = TaskStore::new(backend.clone());
        let state = StateStore::new(backend.clone());
        let costs = CostStore::new(backend.clone());
        let checkpoints = CheckpointManager::new(backend.clone(), tasks.clone());
        let pubsub = PubSub::new(backend);

        let runtime = Arc::new(StaticRuntime::new());
        let spawner = Arc::new(AgentSpawner::new(settings.clone(), runtime));

        let git = GitOps::new(dir.path());
        git.init_repo().await.unwrap();
        tokio::fs::create_dir_all(settings.worktree_base.clone())
            .await
            .unwrap();
        let git = Arc::new(Mutex::new(git));

        let dispatcher = Arc::new(TaskDispatcher::new(
            settings.clone(),
            tasks.clone(),
            state.clone(),
            spawner.clone(),
            git.clone(),
        ));

        let bus = EventBus::new(
            settings,
            tasks.clone(),
            state.clone(),
            costs,
            checkpoints.clone(),
            pubsub,
            spawner.clone(),
            git,
            dispatcher.clone(),
        );

        Harness {
            dir,
            tasks,
            state,
            checkpoints,
            spawner,
            dispatcher,
            bus,
        }
    }

    /// Mimic `POST /tasks`: create the campaign, plan it, spawn a PM
    /// agent, and activate the task.
    async fn create_campaign(&self, prompt: &str) -> Task {
        let mut task = Task::new(prompt, prompt);
        task.prompt = Some(prompt.to_string());
        task.project = Some("demo".to_string());
        let task = self.tasks.create(task).await.unwrap();
        self.tasks
            .update_status(&task.id, TaskStatus::Planned, "orchestrator", "auto-planned")
            .await
            .unwrap();

        let agent = self
            .spawner
            .spawn_agent(&task, AgentRole::Pm, None)
            .await
            .unwrap();
        self.state.set_agent(&agent).await.unwrap();
        self.tasks
            .update_status(
                &task.id,
                TaskStatus::Active,
                "orchestrator",
                &format!("agent={}", agent.id),
            )
            .await
            .unwrap();
        let mut task = self.tasks.get(&task.id).await.unwrap().unwrap();
        task.assigned_to = Some(agent.id.clone());
        self.tasks.update(task).await.unwrap()
    }

    async fn agent_for(&self, task_id: &str, role: AgentRole) -> AgentRecord {
        self.state
            .list_agents()
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.task_id.as_deref() == Some(task_id) && a.role == role)
            .unwrap_or_else(|| panic!("no {role} agent for {task_id}"))
    }

    async fn send_complete(&self, agent: &AgentRecord, output: &str) {
        let msg = Message::new(MessageType::TaskComplete)
            .with_task(agent.task_id.clone().unwrap())
            .with_agent(agent.id.clone())
            .with_data("output", json!(output));
        self.bus.handle_agent_message(msg).await;
    }

    async fn send_failed(&self, agent: &AgentRecord, error: &str) {
        let msg = Message::new(MessageType::TaskFailed)
            .with_task(agent.task_id.clone().unwrap())
            .with_agent(agent.id.clone())
            .with_data("error", json!(error));
        self.bus.handle_agent_message(msg).await;
    }

    /// Resolve the oldest pending checkpoint the way the HTTP handler
    /// does: manager first, then the event-bus hook.
    async fn approve_oldest(&self) -> CheckpointSource {
        let cp = self.checkpoints.get_pending().await.unwrap()[0].clone();
        self.checkpoints.approve(&cp.id).await.unwrap();
        self.bus
            .on_checkpoint_approved(&cp.task_id, cp.source_role)
            .await
            .unwrap();
        cp.source_role
    }

    async fn reject_oldest(&self, reason: &str) -> CheckpointSource {
        let cp = self.checkpoints.get_pending().await.unwrap()[0].clone();
        self.checkpoints.reject(&cp.id, reason).await.unwrap();
        self.bus
            .on_checkpoint_rejected(&cp.task_id, cp.source_role, reason)
            .await
            .unwrap();
        cp.source_role
    }

    async fn status_of(&self, task_id: &str) -> TaskStatus {
        self.tasks.get(task_id).await.unwrap().unwrap().status
    }

    async fn subtask_ids(&self, parent_id: &str) -> Vec<String> {
        self.tasks
            .get(parent_id)
            .await
            .unwrap()
            .unwrap()
            .subtask_ids
    }

    async fn write_workspace_file(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, content).await.unwrap();
    }

    async fn write_worktree_file(&self, task_id: &str, rel: &str, content: &str) {
        let path = self.dispatcher.worktree_path(task_id).join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, content).await.unwrap();
    }

    async fn git_stdout(&self, args: &[&str]) -> String {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .output()
            .await
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// P1: every transition recorded in history is legal.
    async fn assert_history_valid(&self, task_id: &str) {
        let task = self.tasks.get(task_id).await.unwrap().unwrap();
        let mut current = TaskStatus::Created;
        for event in &task.history {
            let Some(next) = event.event.strip_prefix("status_change:") else {
                continue;
            };
            let next: TaskStatus = serde_json::from_str(&format!("\"{next}\"")).unwrap();
            assert!(
                current.can_transition_to(next),
                "illegal transition {current} -> {next} in {task_id}"
            );
            current = next;
        }
        assert_eq!(current, task.status);
    }
}

fn pm_plan(subtasks: &[(&str, &str)]) -> String {
    let subtasks: Vec<_> = subtasks
        .iter()
        .map(|(title, description)| json!({ "title": title, "description": description }))
        .collect();
    format!(
        "Decomposition complete.\n```json\n{}\n```",
        json!({ "analysis": "split the work", "subtasks": subtasks })
    )
}

// ---- Scenario 1: happy path, sequential, no gates ----------------------

#[tokio::test]
async fn happy_sequential_campaign() {
    let h = Harness::new(|_| {}).await;

    let campaign = h.create_campaign("add readme").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "write A")])).await;

    // Plan parsed: one child, campaign blocked on the PM checkpoint
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Blocked);
    let children = h.subtask_ids(&campaign.id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Planned);
    let pending = h.checkpoints.get_pending().await.unwrap();
    assert_eq!(pending[0].source_role, CheckpointSource::Pm);

    // Approval dispatches the dev agent (architect disabled)
    assert_eq!(h.approve_oldest().await, CheckpointSource::Pm);
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Active);

    // Dev writes to the shared workspace and completes
    h.write_workspace_file("README.md", "# readme\n").await;
    let dev = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev, "created README.md").await;

    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Done);
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Done);

    // One work commit on top of the initial one
    let commits = h.git_stdout(&["rev-list", "--count", "HEAD"]).await;
    assert_eq!(commits, "2");

    // Activity log saw both completions
    let logs = h.state.get_logs(100).await.unwrap();
    let completes = logs
        .iter()
        .filter(|e| e["type"] == "task_complete")
        .count();
    assert_eq!(completes, 2);

    // Agent records are gone after cleanup
    assert!(h.state.list_agents().await.unwrap().is_empty());

    h.assert_history_valid(&campaign.id).await;
    h.assert_history_valid(&children[0]).await;
}

// ---- Scenario: duplicate delivery is a no-op ---------------------------

#[tokio::test]
async fn duplicate_task_complete_is_idempotent() {
    let h = Harness::new(|_| {}).await;

    let campaign = h.create_campaign("add readme").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "write A")])).await;
    h.approve_oldest().await;

    let children = h.subtask_ids(&campaign.id).await;
    let dev = h.agent_for(&children[0], AgentRole::Dev).await;
    h.write_workspace_file("a.txt", "a").await;
    h.send_complete(&dev, "done").await;
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Done);

    let history_len = h
        .tasks
        .get(&children[0])
        .await
        .unwrap()
        .unwrap()
        .history
        .len();

    // Same message again: the task is already past the gate
    h.send_complete(&dev, "done").await;
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Done);
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Done);
    assert_eq!(
        h.tasks.get(&children[0]).await.unwrap().unwrap().history.len(),
        history_len
    );
}

// ---- Scenario: unparseable PM output fails the campaign ----------------

#[tokio::test]
async fn unparseable_pm_output_fails_campaign() {
    let h = Harness::new(|_| {}).await;

    let campaign = h.create_campaign("do something").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, "I could not produce a plan.").await;

    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Rejected);
    assert!(h.checkpoints.get_pending().await.unwrap().is_empty());
    h.assert_history_valid(&campaign.id).await;
}

// ---- Scenario: rejecting the plan abandons the decomposition -----------

#[tokio::test]
async fn rejected_plan_cleans_up_subtasks() {
    let h = Harness::new(|_| {}).await;

    let campaign = h.create_campaign("two things").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "a"), ("B", "b")])).await;

    h.reject_oldest("wrong direction").await;

    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Rejected);
    for child_id in h.subtask_ids(&campaign.id).await {
        assert_eq!(h.status_of(&child_id).await, TaskStatus::Rejected);
    }
}

// ---- Scenario 2: parallel with an auto-resolved conflict ---------------

#[tokio::test]
async fn parallel_campaign_auto_resolves_artifact_conflict() {
    let h = Harness::new(|s| s.dispatch_mode = DispatchMode::Parallel).await;

    let original_branch = h.git_stdout(&["rev-parse", "--abbrev-ref", "HEAD"]).await;

    let campaign = h.create_campaign("two features").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "a"), ("B", "b")])).await;
    h.approve_oldest().await;

    let children = h.subtask_ids(&campaign.id).await;
    for child_id in &children {
        assert_eq!(h.status_of(child_id).await, TaskStatus::Active);
    }

    // Both touch the same generated artifact with different contents
    h.write_worktree_file(&children[0], ".coverage", "run-1\n").await;
    h.write_worktree_file(&children[0], "a.py", "A\n").await;
    let dev0 = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev0, "feature A done").await;
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Done);

    h.write_worktree_file(&children[1], ".coverage", "run-2\n").await;
    h.write_worktree_file(&children[1], "b.py", "B\n").await;
    let dev1 = h.agent_for(&children[1], AgentRole::Dev).await;
    h.send_complete(&dev1, "feature B done").await;

    // Auto-resolution let the campaign finish and merge back
    assert_eq!(h.status_of(&children[1]).await, TaskStatus::Done);
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Done);
    assert!(h.checkpoints.get_pending().await.unwrap().is_empty());

    // Back on the original branch with all work merged
    let branch = h.git_stdout(&["rev-parse", "--abbrev-ref", "HEAD"]).await;
    assert_eq!(branch, original_branch);
    assert!(h.dir.path().join("a.py").exists());
    assert!(h.dir.path().join("b.py").exists());

    // Worktrees and branches are gone
    assert!(!h.dispatcher.worktree_path(&children[0]).exists());
    let branches = h.git_stdout(&["branch", "--list"]).await;
    assert!(!branches.contains("task-"), "task branches linger: {branches}");
    assert!(!branches.contains("campaign-"), "campaign branch lingers: {branches}");
}

// ---- Scenario 3: real conflict escalates to a checkpoint ---------------

#[tokio::test]
async fn parallel_campaign_escalates_source_conflict() {
    let h = Harness::new(|s| s.dispatch_mode = DispatchMode::Parallel).await;

    let campaign = h.create_campaign("conflicting features").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "a"), ("B", "b")])).await;
    h.approve_oldest().await;

    let children = h.subtask_ids(&campaign.id).await;

    h.write_worktree_file(&children[0], "src/main.py", "print('A')\n")
        .await;
    let dev0 = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev0, "feature A done").await;

    h.write_worktree_file(&children[1], "src/main.py", "print('B')\n")
        .await;
    let dev1 = h.agent_for(&children[1], AgentRole::Dev).await;
    h.send_complete(&dev1, "feature B done").await;

    // The sub-task itself finished; the conflict pauses the campaign
    assert_eq!(h.status_of(&children[1]).await, TaskStatus::Done);
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Blocked);

    let pending = h.checkpoints.get_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_role, CheckpointSource::MergeConflict);
    assert!(pending[0].description.contains("src/main.py"));
    assert_eq!(pending[0].task_id, campaign.id);

    // The workspace holds A's merged version; the merge was aborted
    let content = tokio::fs::read_to_string(h.dir.path().join("src/main.py"))
        .await
        .unwrap();
    assert_eq!(content, "print('A')\n");

    // Approving commits whatever resolution is in the working copy and
    // finishes the campaign
    h.write_workspace_file("src/main.py", "print('A')\nprint('B')\n")
        .await;
    h.approve_oldest().await;
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Done);
    assert!(h.checkpoints.get_pending().await.unwrap().is_empty());
}

// ---- Scenario 4: reviewer rejects, retries, then escalates -------------

#[tokio::test]
async fn reviewer_reject_retries_then_escalates() {
    let h = Harness::new(|s| {
        s.agent.reviewer_enabled = true;
        s.agent.review_mode = ReviewMode::PerSubtask;
        s.agent.reviewer_max_retries = 1;
    })
    .await;

    let campaign = h.create_campaign("reviewed feature").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "write A")])).await;
    h.approve_oldest().await;
    let children = h.subtask_ids(&campaign.id).await;

    h.write_workspace_file("a.txt", "v1").await;
    let dev = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev, "first attempt").await;
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Review);

    // First rejection: back to dev with feedback
    let reviewer = h.agent_for(&children[0], AgentRole::Reviewer).await;
    h.send_complete(&reviewer, "```json\n{\"verdict\": \"reject\", \"summary\": \"bad\"}\n```")
        .await;

    let task = h.tasks.get(&children[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Active);
    assert_eq!(task.agent_outputs.get("reviewer_feedback").unwrap(), "bad");
    assert_eq!(task.agent_outputs.get("reviewer_retry_count").unwrap(), "1");

    // Second attempt, second rejection: retries exhausted
    h.write_workspace_file("a.txt", "v2").await;
    let dev = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev, "second attempt").await;
    let reviewer = h.agent_for(&children[0], AgentRole::Reviewer).await;
    h.send_complete(
        &reviewer,
        "```json\n{\"verdict\": \"reject\", \"summary\": \"still bad\"}\n```",
    )
    .await;

    let pending = h.checkpoints.get_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_role, CheckpointSource::Reviewer);
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Blocked);
    h.assert_history_valid(&children[0]).await;
}

// ---- Scenario: security concerns checkpoint regardless of verdict -----

#[tokio::test]
async fn security_concerns_always_escalate() {
    let h = Harness::new(|s| {
        s.agent.reviewer_enabled = true;
        s.agent.review_mode = ReviewMode::PerSubtask;
    })
    .await;

    let campaign = h.create_campaign("feature").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "write A")])).await;
    h.approve_oldest().await;
    let children = h.subtask_ids(&campaign.id).await;

    let dev = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev, "done").await;
    let reviewer = h.agent_for(&children[0], AgentRole::Reviewer).await;
    h.send_complete(
        &reviewer,
        "```json\n{\"verdict\": \"approve\", \"security_concerns\": [\"hardcoded token\"]}\n```",
    )
    .await;

    let pending = h.checkpoints.get_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_role, CheckpointSource::Reviewer);
    assert!(pending[0].description.contains("hardcoded token"));
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Blocked);
}

// ---- Scenario 5: QA fails then passes on retry -------------------------

#[tokio::test]
async fn qa_fails_then_passes_on_retry() {
    let h = Harness::new(|s| {
        s.agent.qa_enabled = true;
        s.agent.qa_mode = ReviewMode::PerSubtask;
        s.agent.qa_max_retries = 1;
    })
    .await;

    let campaign = h.create_campaign("tested feature").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "write A")])).await;
    h.approve_oldest().await;
    let children = h.subtask_ids(&campaign.id).await;

    h.write_workspace_file("a.txt", "v1").await;
    let dev = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev, "first attempt").await;
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Testing);

    let qa = h.agent_for(&children[0], AgentRole::Qa).await;
    h.send_complete(
        &qa,
        "```json\n{\"verdict\": \"fail\", \"summary\": \"test_x fails\"}\n```",
    )
    .await;

    let task = h.tasks.get(&children[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Active);
    assert_eq!(task.agent_outputs.get("qa_retry_count").unwrap(), "1");
    assert_eq!(task.agent_outputs.get("qa_feedback").unwrap(), "test_x fails");

    h.write_workspace_file("a.txt", "v2").await;
    let dev = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev, "second attempt").await;
    let qa = h.agent_for(&children[0], AgentRole::Qa).await;
    h.send_complete(&qa, "```json\n{\"verdict\": \"pass\"}\n```").await;

    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Done);
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Done);
    let task = h.tasks.get(&children[0]).await.unwrap().unwrap();
    assert_eq!(task.agent_outputs.get("qa_retry_count").unwrap(), "1");
    h.assert_history_valid(&children[0]).await;
}

// ---- Scenario 6: agent failure among parallel siblings -----------------

#[tokio::test]
async fn agent_failure_pauses_then_skip_completes_campaign() {
    let h = Harness::new(|s| s.dispatch_mode = DispatchMode::Parallel).await;

    let campaign = h.create_campaign("three features").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "a"), ("B", "b"), ("C", "c")]))
        .await;
    h.approve_oldest().await;
    let children = h.subtask_ids(&campaign.id).await;
    assert_eq!(children.len(), 3);

    // The middle agent dies
    let dev1 = h.agent_for(&children[1], AgentRole::Dev).await;
    h.send_failed(&dev1, "container OOM").await;

    assert_eq!(h.status_of(&children[1]).await, TaskStatus::Rejected);
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Blocked);
    let pending = h.checkpoints.get_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_role, CheckpointSource::AgentFailed);
    assert_eq!(pending[0].task_id, campaign.id);

    // The other two finish while the checkpoint is pending
    h.write_worktree_file(&children[0], "a.py", "A\n").await;
    let dev0 = h.agent_for(&children[0], AgentRole::Dev).await;
    h.send_complete(&dev0, "feature A done").await;

    h.write_worktree_file(&children[2], "c.py", "C\n").await;
    let dev2 = h.agent_for(&children[2], AgentRole::Dev).await;
    h.send_complete(&dev2, "feature C done").await;

    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Done);
    assert_eq!(h.status_of(&children[2]).await, TaskStatus::Done);
    // Still parked on the human decision
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Blocked);

    // Approving skips the failed sub-task and completes the campaign
    assert_eq!(h.approve_oldest().await, CheckpointSource::AgentFailed);
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Done);
    assert_eq!(h.status_of(&children[1]).await, TaskStatus::Rejected);
    assert!(h.checkpoints.get_pending().await.unwrap().is_empty());
    assert!(h.dir.path().join("a.py").exists());
    assert!(h.dir.path().join("c.py").exists());

    // P4: no agent records survive the campaign
    assert!(h.state.list_agents().await.unwrap().is_empty());
}

// ---- Architect gate --------------------------------------------------

#[tokio::test]
async fn architect_review_adds_a_second_checkpoint_and_guidance() {
    let h = Harness::new(|s| s.agent.architect_review = true).await;

    let campaign = h.create_campaign("designed feature").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "write A")])).await;

    // Approving the plan spawns the architect instead of dispatching
    assert_eq!(h.approve_oldest().await, CheckpointSource::Pm);
    let children = h.subtask_ids(&campaign.id).await;
    assert_eq!(h.status_of(&children[0]).await, TaskStatus::Planned);

    let architect = h.agent_for(&campaign.id, AgentRole::Architect).await;
    h.send_complete(
        &architect,
        "```json\n{\"design_notes\": \"Keep modules small\", \"decisions\": []}\n```",
    )
    .await;

    let pending = h.checkpoints.get_pending().await.unwrap();
    assert_eq!(pending[0].source_role, CheckpointSource::Architect);

    // Approving the design dispatches with guidance appended
    assert_eq!(h.approve_oldest().await, CheckpointSource::Architect);
    let child = h.tasks.get(&children[0]).await.unwrap().unwrap();
    assert_eq!(child.status, TaskStatus::Active);
    assert!(child.description.contains("## Architecture Guidance"));
    assert!(child.description.contains("Keep modules small"));
}

// ---- P2/P3 invariants across a mixed run -------------------------------

#[tokio::test]
async fn pending_checkpoints_always_reference_blocked_tasks() {
    let h = Harness::new(|s| s.dispatch_mode = DispatchMode::Parallel).await;

    let campaign = h.create_campaign("invariants").await;
    let pm = h.agent_for(&campaign.id, AgentRole::Pm).await;
    h.send_complete(&pm, &pm_plan(&[("A", "a"), ("B", "b")])).await;

    // P2 at the PM checkpoint
    for cp in h.checkpoints.get_pending().await.unwrap() {
        assert_eq!(h.status_of(&cp.task_id).await, TaskStatus::Blocked);
    }

    h.approve_oldest().await;
    // P2 second half: the task is ACTIVE after resolution
    assert_eq!(h.status_of(&campaign.id).await, TaskStatus::Active);

    // P3: every ACTIVE child has its dependencies DONE (none here)
    for child_id in h.subtask_ids(&campaign.id).await {
        let child = h.tasks.get(&child_id).await.unwrap().unwrap();
        if matches!(
            child.status,
            TaskStatus::Active | TaskStatus::Review | TaskStatus::Testing
        ) {
            for dep in &child.depends_on {
                assert_eq!(h.status_of(dep).await, TaskStatus::Done);
            }
        }
    }
}
