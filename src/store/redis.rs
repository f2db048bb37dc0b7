use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{keys, SharedStore};

/// Redis-backed shared store.
///
/// The multiplexed connection is cheap to clone; every call clones it so
/// concurrent loops never contend on a single pipeline.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connects to `addr` (`host:port`, a `redis://` URL also accepted).
    pub async fn connect(addr: &str) -> Result<Self> {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{}", addr)
        };

        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("invalid redis address {}", addr))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("failed to connect to redis at {}", addr))?;

        tracing::info!("Connected to redis at {}", addr);
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zset_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(key, 0, limit as isize - 1).await?;
        Ok(members)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.zcard(key).await?;
        Ok(len)
    }

    async fn zset_trim_below(&self, key: &str, max_score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrembyscore(key, "-inf", max_score).await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: bool = conn.hset_nx(key, field, value).await?;
        Ok(created)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn hash_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(entries)
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.hlen(key).await?;
        Ok(len)
    }

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.hexists(key, field).await?;
        Ok(exists)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let matched: Vec<String> = conn.keys(pattern).await?;
        Ok(matched)
    }

    async fn register_worker(&self, worker_id: &str, now_secs: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(keys::WORKERS, worker_id, now_secs)
            .ignore()
            .del(vec![
                keys::worker_inbox(worker_id),
                keys::worker_processing(worker_id),
                keys::worker_outbox(worker_id),
            ])
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
