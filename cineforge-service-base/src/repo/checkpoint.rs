use crate::db::PostgresPool;
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One workflow snapshot. `thread_id` is the project id; `checkpoint_ns`
/// separates independent graphs over the same thread (currently only the
/// default namespace is used).
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: Uuid,
    pub checkpoint: Value,
    #[sqlx(rename = "type")]
    pub checkpoint_type: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointRepo: Send + Sync {
    async fn save(&self, record: CheckpointRecord) -> Result<(), RepoError>;

    async fn latest(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
    ) -> Result<Option<CheckpointRecord>, RepoError>;

    async fn list(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        limit: i64,
    ) -> Result<Vec<CheckpointRecord>, RepoError>;
}

pub struct DbCheckpointRepo {
    db_pool: PostgresPool,
}

impl DbCheckpointRepo {
    pub fn new(db_pool: PostgresPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl CheckpointRepo for DbCheckpointRepo {
    async fn save(&self, record: CheckpointRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO checkpoints
                (thread_id, checkpoint_ns, checkpoint_id, checkpoint, type, created_at)
              VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.thread_id)
        .bind(&record.checkpoint_ns)
        .bind(record.checkpoint_id)
        .bind(&record.checkpoint)
        .bind(&record.checkpoint_type)
        .bind(record.created_at);
        self.db_pool
            .with_rw("checkpoint", "save")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn latest(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
    ) -> Result<Option<CheckpointRecord>, RepoError> {
        let query = sqlx::query_as::<_, CheckpointRecord>(
            r#"
              SELECT * FROM checkpoints
              WHERE thread_id = $1 AND checkpoint_ns = $2
              ORDER BY created_at DESC
              LIMIT 1
            "#,
        )
        .bind(thread_id)
        .bind(checkpoint_ns);
        self.db_pool
            .with_ro("checkpoint", "latest")
            .fetch_optional_as(query)
            .await
    }

    async fn list(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        limit: i64,
    ) -> Result<Vec<CheckpointRecord>, RepoError> {
        let query = sqlx::query_as::<_, CheckpointRecord>(
            r#"
              SELECT * FROM checkpoints
              WHERE thread_id = $1 AND checkpoint_ns = $2
              ORDER BY created_at DESC
              LIMIT $3
            "#,
        )
        .bind(thread_id)
        .bind(checkpoint_ns)
        .bind(limit);
        self.db_pool
            .with_ro("checkpoint", "list")
            .fetch_all_as(query)
            .await
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointRepo {
    checkpoints: Arc<Mutex<HashMap<(String, String), Vec<CheckpointRecord>>>>,
}

impl InMemoryCheckpointRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointRepo for InMemoryCheckpointRepo {
    async fn save(&self, record: CheckpointRecord) -> Result<(), RepoError> {
        let mut checkpoints = self.checkpoints.lock().await;
        checkpoints
            .entry((record.thread_id.clone(), record.checkpoint_ns.clone()))
            .or_default()
            .push(record);
        Ok(())
    }

    async fn latest(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
    ) -> Result<Option<CheckpointRecord>, RepoError> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints
            .get(&(thread_id.to_string(), checkpoint_ns.to_string()))
            .and_then(|records| records.last().cloned()))
    }

    async fn list(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        limit: i64,
    ) -> Result<Vec<CheckpointRecord>, RepoError> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints
            .get(&(thread_id.to_string(), checkpoint_ns.to_string()))
            .map(|records| {
                records
                    .iter()
                    .rev()
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
