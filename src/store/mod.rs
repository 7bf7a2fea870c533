//! Persistent store for all orchestrator state.
//!
//! Every piece of global mutable state (tasks, agents, checkpoints, the
//! activity log, the cost ledger, the paused flag) lives behind the
//! [`StoreBackend`] trait rather than in process-local singletons, so the
//! orchestrator survives restarts when a durable backend is configured.
//!
//! Two backends exist: [`redis::RedisBackend`] for production and
//! [`memory::MemoryBackend`] for tests and Redis-less development. The typed
//! stores ([`TaskStore`], [`StateStore`], [`CostStore`]) and the pub/sub bus
//! are thin layers over the backend primitives; all values are JSON.

pub mod cost_store;
pub mod memory;
pub mod redis;
pub mod state_store;
pub mod task_store;

pub use cost_store::CostStore;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use state_store::StateStore;
pub use task_store::TaskStore;

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The primitive operations every backend must provide.
///
/// The surface intentionally mirrors the persisted layout: plain keys,
/// ordered sets for indexes, a capped list for the activity log, a float
/// counter for cost totals, and named pub/sub channels.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Add `member` to the ordered set at `key` with the given score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// All members of the ordered set at `key`, ascending by score.
    async fn zrange_all(&self, key: &str) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// Prepend to the list at `key`.
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;
    /// Prepend to the list at `key`, trimming it to at most `cap` entries.
    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()>;
    /// The first `limit` entries of the list at `key` (newest first).
    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>>;
    /// The entire list at `key`.
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;

    async fn incr_by_float(&self, key: &str, amount: f64) -> Result<f64>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    /// Subscribe to a channel. Delivery is at-least-once within a single
    /// orchestrator process; consumers must be idempotent.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// Shared handle to whichever backend the deployment selected.
pub type Store = Arc<dyn StoreBackend>;

/// Pub/sub convenience wrapper for typed [`crate::models::Message`] envelopes.
#[derive(Clone)]
pub struct PubSub {
    store: Store,
}

impl PubSub {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn publish(&self, channel: &str, message: &crate::models::Message) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.store.publish(channel, &payload).await
    }

    /// Typed subscription. Payloads that fail to deserialize are dropped
    /// with a warning; a malformed publisher must not wedge the reactor.
    pub async fn listen(
        &self,
        channel: &str,
    ) -> Result<mpsc::Receiver<crate::models::Message>> {
        let mut raw = self.store.subscribe(channel).await?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(payload) = raw.recv().await {
                match serde_json::from_str(&payload) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping malformed message on pub/sub: {}", e);
                    }
                }
            }
        });
        Ok(rx)
    }
}
