//! Agent records, the capped activity log, and the pause flag.

use super::Store;
use crate::models::AgentRecord;
use crate::Result;
use serde_json::Value;

const AGENT_PREFIX: &str = "agent";
const AGENT_INDEX: &str = "agents:all";
const LOG_KEY: &str = "logs:activity";
const PAUSED_KEY: &str = "system:paused";

/// Most-recent entries kept in the activity log; older entries are dropped.
pub const ACTIVITY_LOG_CAP: usize = 1000;

#[derive(Clone)]
pub struct StateStore {
    store: Store,
}

impl StateStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn agent_key(agent_id: &str) -> String {
        format!("{AGENT_PREFIX}:{agent_id}")
    }

    pub async fn set_agent(&self, agent: &AgentRecord) -> Result<()> {
        let data = serde_json::to_string(agent)?;
        self.store.set(&Self::agent_key(&agent.id), &data).await?;
        self.store.sadd(AGENT_INDEX, &agent.id).await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        match self.store.get(&Self::agent_key(agent_id)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let ids = self.store.smembers(AGENT_INDEX).await?;
        let mut agents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(agent) = self.get_agent(&id).await? {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        self.store.delete(&Self::agent_key(agent_id)).await?;
        self.store.srem(AGENT_INDEX, agent_id).await
    }

    /// Append a message (as JSON) to the activity log, newest first.
    pub async fn append_log(&self, entry: &Value) -> Result<()> {
        let data = serde_json::to_string(entry)?;
        self.store
            .lpush_capped(LOG_KEY, &data, ACTIVITY_LOG_CAP)
            .await
    }

    pub async fn get_logs(&self, limit: usize) -> Result<Vec<Value>> {
        let raw = self.store.lrange(LOG_KEY, limit).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            if let Ok(value) = serde_json::from_str(&item) {
                entries.push(value);
            }
        }
        Ok(entries)
    }

    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.store
            .set(PAUSED_KEY, if paused { "1" } else { "0" })
            .await
    }

    pub async fn is_paused(&self) -> Result<bool> {
        Ok(self.store.get(PAUSED_KEY).await?.as_deref() == Some("1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRole, AgentState};
    use crate::store::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn agent_lifecycle() {
        let state = store();
        let mut agent = AgentRecord::new(AgentRole::Dev, "task_1");
        state.set_agent(&agent).await.unwrap();

        agent.status = AgentState::Active;
        state.set_agent(&agent).await.unwrap();

        let loaded = state.get_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentState::Active);
        assert_eq!(state.list_agents().await.unwrap().len(), 1);

        state.remove_agent(&agent.id).await.unwrap();
        assert!(state.get_agent(&agent.id).await.unwrap().is_none());
        assert!(state.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn activity_log_is_capped() {
        let state = store();
        for i in 0..(ACTIVITY_LOG_CAP + 50) {
            state.append_log(&json!({ "seq": i })).await.unwrap();
        }
        let logs = state.get_logs(ACTIVITY_LOG_CAP + 100).await.unwrap();
        assert_eq!(logs.len(), ACTIVITY_LOG_CAP);
        // Newest first
        assert_eq!(logs[0]["seq"], ACTIVITY_LOG_CAP as i64 + 49);
    }

    #[tokio::test]
    async fn pause_flag_round_trips() {
        let state = store();
        assert!(!state.is_paused().await.unwrap());
        state.set_paused(true).await.unwrap();
        assert!(state.is_paused().await.unwrap());
        state.set_paused(false).await.unwrap();
        assert!(!state.is_paused().await.unwrap());
    }
}
