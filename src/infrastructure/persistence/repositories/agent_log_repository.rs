use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::repositories::AgentLogRepository;

pub struct SqliteAgentLogRepository {
    pool: SqlitePool,
}

impl SqliteAgentLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentLogRepository for SqliteAgentLogRepository {
    async fn append(&self, agent_id: i64, action: &str, details: serde_json::Value) -> Result<()> {
        sqlx::query("INSERT INTO agent_logs (agent_id, action, details, created_at) VALUES (?, ?, ?, ?)")
            .bind(agent_id)
            .bind(action)
            .bind(details.to_string())
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .context("Failed to append agent log")?;
        Ok(())
    }
}
