use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry in the append-only cost ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub task_id: String,
    pub agent_role: String,
    /// USD as reported by the agent runtime.
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view served by `GET /costs`
///
/// The running total is maintained independently of the entry list; under
/// at-least-once delivery a duplicate entry may be double-counted, so the
/// total is advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub total: f64,
    pub by_role: HashMap<String, f64>,
    pub entries: Vec<CostEntry>,
}
