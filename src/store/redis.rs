//! Redis-backed store.
//!
//! Uses a multiplexed [`ConnectionManager`] for commands (reconnects
//! transparently) and a dedicated pub/sub connection per subscription.
//! Key layout: `task:{id}`, `tasks:all`, `agent:{id}`, `agents:all`,
//! `checkpoint:{id}`, `checkpoints:pending`, `logs:activity`,
//! `costs:{project}` / `costs:{project}:total`, `system:paused`.

use super::StoreBackend;
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    manager: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        info!("Connected to Redis at {}", url);
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        Ok(con.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.del(key).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        Ok(con.zrange(key, 0, -1).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.zrem(key, member).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.sadd(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        Ok(con.smembers(key).await?)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.srem(key, member).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.lpush(key, value).await?;
        Ok(())
    }

    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.lpush(key, value).await?;
        let _: () = con.ltrim(key, 0, cap as isize - 1).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        Ok(con.lrange(key, 0, limit as isize - 1).await?)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        Ok(con.lrange(key, 0, -1).await?)
    }

    async fn incr_by_float(&self, key: &str, amount: f64) -> Result<f64> {
        let mut con = self.manager.clone();
        let total: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(amount)
            .query_async(&mut con)
            .await?;
        Ok(total)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Non-UTF8 payload on {}: {}", channel, e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
