//! Redis-backed distributed KV: TTL throttles and advisory locks
//! shared by every worker process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::domain::ports::DistributedStore;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.context("Redis GET failed")?;
        Ok(value)
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .context("Redis SETEX failed")?;
        Ok(())
    }

    async fn try_lock(&self, name: &str, ttl_secs: u64) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        // SET NX EX: atomically take the lock only when free; the TTL
        // bounds stuck locks across worker crashes.
        let acquired: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .context("Redis lock acquire failed")?;
        Ok(acquired.map(|_| token))
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(name).await.context("Redis lock read failed")?;
        if holder.as_deref() == Some(token) {
            conn.del::<_, ()>(name).await.context("Redis lock release failed")?;
        }
        Ok(())
    }
}
