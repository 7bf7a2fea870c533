//! Task CRUD and the only legal path for status changes.

use super::Store;
use crate::models::{Task, TaskEvent, TaskStatus};
use crate::{LegatusError, Result};
use chrono::Utc;

const KEY_PREFIX: &str = "task";
const INDEX_KEY: &str = "tasks:all";

#[derive(Clone)]
pub struct TaskStore {
    store: Store,
}

impl TaskStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn key(task_id: &str) -> String {
        format!("{KEY_PREFIX}:{task_id}")
    }

    pub async fn create(&self, task: Task) -> Result<Task> {
        let data = serde_json::to_string(&task)?;
        self.store.set(&Self::key(&task.id), &data).await?;
        self.store
            .zadd(INDEX_KEY, &task.id, task.created_at.timestamp_millis() as f64)
            .await?;
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        match self.store.get(&Self::key(task_id)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Get, erroring on absence. For call sites where a missing task is a
    /// logic bug rather than user input.
    pub async fn get_required(&self, task_id: &str) -> Result<Task> {
        self.get(task_id)
            .await?
            .ok_or_else(|| LegatusError::TaskNotFound(task_id.to_string()))
    }

    /// All tasks in creation order.
    pub async fn list_all(&self) -> Result<Vec<Task>> {
        let ids = self.store.zrange_all(INDEX_KEY).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    pub async fn update(&self, mut task: Task) -> Result<Task> {
        task.updated_at = Utc::now();
        let data = serde_json::to_string(&task)?;
        self.store.set(&Self::key(&task.id), &data).await?;
        Ok(task)
    }

    /// Validate and execute a state transition, appending a history event.
    ///
    /// This is the *only* mutation path for `Task::status`. Invalid
    /// transitions are programmer errors and are refused loudly.
    pub async fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        by: &str,
        detail: &str,
    ) -> Result<Task> {
        let mut task = self.get_required(task_id).await?;

        if !task.status.can_transition_to(new_status) {
            return Err(LegatusError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: new_status.to_string(),
            });
        }

        task.status = new_status;
        task.history.push(TaskEvent::new(
            format!("status_change:{new_status}"),
            Some(by),
            Some(detail),
        ));
        self.update(task).await
    }

    pub async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    /// Highest-priority PLANNED task whose dependencies are all DONE.
    /// Priority 1 is highest.
    pub async fn get_next_ready(&self) -> Result<Option<Task>> {
        let mut planned = self.get_by_status(TaskStatus::Planned).await?;
        planned.sort_by_key(|t| t.priority);

        for task in planned {
            if self.deps_satisfied(&task).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    pub async fn deps_satisfied(&self, task: &Task) -> Result<bool> {
        for dep_id in &task.depends_on {
            match self.get(dep_id).await? {
                Some(dep) if dep.status == TaskStatus::Done => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
