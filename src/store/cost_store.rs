//! Per-project API cost ledger.

use super::Store;
use crate::models::{CostBreakdown, CostEntry};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;

const PREFIX: &str = "costs";

#[derive(Clone)]
pub struct CostStore {
    store: Store,
}

impl CostStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn key(project_id: Option<&str>) -> String {
        format!("{PREFIX}:{}", project_id.unwrap_or("default"))
    }

    /// Record a cost entry and bump the running total.
    ///
    /// The total is advisory: under at-least-once delivery a duplicate
    /// TASK_COMPLETE may count an entry twice.
    pub async fn record(
        &self,
        task_id: &str,
        agent_role: &str,
        cost: f64,
        project_id: Option<&str>,
    ) -> Result<()> {
        let key = Self::key(project_id);
        let entry = CostEntry {
            task_id: task_id.to_string(),
            agent_role: agent_role.to_string(),
            cost,
            timestamp: Utc::now(),
        };
        let data = serde_json::to_string(&entry)?;
        self.store.lpush(&key, &data).await?;
        self.store
            .incr_by_float(&format!("{key}:total"), cost)
            .await?;
        Ok(())
    }

    pub async fn get_breakdown(&self, project_id: Option<&str>) -> Result<CostBreakdown> {
        let key = Self::key(project_id);

        let total = self
            .store
            .get(&format!("{key}:total"))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        let raw = self.store.lrange_all(&key).await?;
        let mut entries: Vec<CostEntry> = Vec::with_capacity(raw.len());
        for item in raw {
            if let Ok(entry) = serde_json::from_str(&item) {
                entries.push(entry);
            }
        }

        let mut by_role: HashMap<String, f64> = HashMap::new();
        for entry in &entries {
            *by_role.entry(entry.agent_role.clone()).or_insert(0.0) += entry.cost;
        }

        Ok(CostBreakdown {
            total,
            by_role,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn record_and_breakdown() {
        let costs = CostStore::new(Arc::new(MemoryBackend::new()));
        costs.record("task_1", "pm", 0.10, Some("demo")).await.unwrap();
        costs.record("task_2", "dev", 0.50, Some("demo")).await.unwrap();
        costs.record("task_2", "dev", 0.15, Some("demo")).await.unwrap();

        let breakdown = costs.get_breakdown(Some("demo")).await.unwrap();
        assert!((breakdown.total - 0.75).abs() < 1e-9);
        assert!((breakdown.by_role["dev"] - 0.65).abs() < 1e-9);
        assert!((breakdown.by_role["pm"] - 0.10).abs() < 1e-9);
        assert_eq!(breakdown.entries.len(), 3);

        // Projects are isolated
        let other = costs.get_breakdown(None).await.unwrap();
        assert_eq!(other.entries.len(), 0);
        assert_eq!(other.total, 0.0);
    }
}
