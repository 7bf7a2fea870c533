//! In-process store backend.
//!
//! Used by the test suite and by Redis-less development runs. State does not
//! survive a restart; everything else behaves like the Redis backend,
//! including newest-first capped lists and broadcast-style pub/sub.

use super::StoreBackend;
use crate::{LegatusError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

#[derive(Default)]
struct Inner {
    kv: HashMap<String, String>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().await.kv.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.push((score, member.to_string()));
        zset.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .await
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(zset) = self.inner.write().await.zsets.get_mut(key) {
            zset.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .await
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.inner.write().await.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut inner = self.inner.write().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(cap);
        Ok(())
    }

    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .await
            .lists
            .get(key)
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .await
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn incr_by_float(&self, key: &str, amount: f64) -> Result<f64> {
        let mut inner = self.inner.write().await;
        let entry = inner.kv.entry(key.to_string()).or_insert_with(|| "0".into());
        let current: f64 = entry
            .parse()
            .map_err(|_| LegatusError::Store(format!("non-numeric counter at {key}")))?;
        let next = current + amount;
        *entry = next.to_string();
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // A send error only means nobody is listening yet.
        let _ = self.sender_for(channel).await.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut source = self.sender_for(channel).await.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("In-memory subscriber lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("task:1", "{}").await.unwrap();
        assert_eq!(backend.get("task:1").await.unwrap().as_deref(), Some("{}"));
        backend.delete("task:1").await.unwrap();
        assert_eq!(backend.get("task:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zset_orders_by_score_and_replaces_members() {
        let backend = MemoryBackend::new();
        backend.zadd("tasks:all", "b", 2.0).await.unwrap();
        backend.zadd("tasks:all", "a", 1.0).await.unwrap();
        backend.zadd("tasks:all", "c", 3.0).await.unwrap();
        assert_eq!(backend.zrange_all("tasks:all").await.unwrap(), ["a", "b", "c"]);

        // Re-adding with a new score moves, not duplicates
        backend.zadd("tasks:all", "a", 4.0).await.unwrap();
        assert_eq!(backend.zrange_all("tasks:all").await.unwrap(), ["b", "c", "a"]);

        backend.zrem("tasks:all", "b").await.unwrap();
        assert_eq!(backend.zrange_all("tasks:all").await.unwrap(), ["c", "a"]);
    }

    #[tokio::test]
    async fn capped_list_keeps_newest_first() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend
                .lpush_capped("logs:activity", &i.to_string(), 3)
                .await
                .unwrap();
        }
        assert_eq!(
            backend.lrange("logs:activity", 10).await.unwrap(),
            ["4", "3", "2"]
        );
        assert_eq!(backend.lrange("logs:activity", 2).await.unwrap(), ["4", "3"]);
    }

    #[tokio::test]
    async fn float_counter_accumulates() {
        let backend = MemoryBackend::new();
        assert!((backend.incr_by_float("costs:p:total", 0.5).await.unwrap() - 0.5).abs() < 1e-9);
        assert!((backend.incr_by_float("costs:p:total", 0.25).await.unwrap() - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscribers() {
        let backend = MemoryBackend::new();
        let mut rx = backend.subscribe("events:agent").await.unwrap();
        backend.publish("events:agent", "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
