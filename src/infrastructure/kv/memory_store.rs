//! In-process KV store with the same TTL and lock semantics as the
//! Redis implementation; used by tests and single-process runs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::ports::DistributedStore;

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: Option<&(String, Instant)>) -> Option<String> {
        entry.and_then(|(value, expires_at)| (*expires_at > Instant::now()).then(|| value.clone()))
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let value = Self::live(entries.get(key));
        if value.is_none() {
            entries.remove(key);
        }
        Ok(value)
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            (value.to_string(), Instant::now() + Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }

    async fn try_lock(&self, name: &str, ttl_secs: u64) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        if Self::live(entries.get(name)).is_some() {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        entries.insert(
            name.to_string(),
            (token.clone(), Instant::now() + Duration::from_secs(ttl_secs)),
        );
        Ok(Some(token))
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if Self::live(entries.get(name)).as_deref() == Some(token) {
            entries.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setex_expires() {
        let store = MemoryStore::new();
        store.setex("k", 60, "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let token = store.try_lock("lock", 60).await.unwrap().expect("first acquire");
        assert!(store.try_lock("lock", 60).await.unwrap().is_none());

        // A stale token cannot release someone else's lock.
        store.unlock("lock", "wrong-token").await.unwrap();
        assert!(store.try_lock("lock", 60).await.unwrap().is_none());

        store.unlock("lock", &token).await.unwrap();
        assert!(store.try_lock("lock", 60).await.unwrap().is_some());
    }
}
