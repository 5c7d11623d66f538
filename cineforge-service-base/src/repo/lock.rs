use crate::db::PostgresPool;
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub project_id: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lock_version: i64,
    pub metadata: Value,
}

#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Deletes and returns every row whose lease has expired.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>, RepoError>;

    /// Upsert that inserts when absent and steals rows that are expired or
    /// already owned by this worker. Returns whether the lock is now held.
    async fn try_acquire(
        &self,
        project_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        metadata: Value,
    ) -> Result<bool, RepoError>;

    /// Extends the lease only while `worker_id` still matches. A `false`
    /// return means the lock was lost.
    async fn renew(
        &self,
        project_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, RepoError>;

    /// Deletes the row only while `worker_id` still matches.
    async fn release(&self, project_id: &str, worker_id: &str) -> Result<bool, RepoError>;

    /// Unconditional delete; operator escape hatch.
    async fn force_release(&self, project_id: &str) -> Result<bool, RepoError>;

    async fn get(&self, project_id: &str) -> Result<Option<LockRecord>, RepoError>;

    async fn get_for_worker(&self, worker_id: &str) -> Result<Vec<LockRecord>, RepoError>;
}

pub struct DbLockRepo {
    db_pool: PostgresPool,
}

impl DbLockRepo {
    pub fn new(db_pool: PostgresPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl LockRepo for DbLockRepo {
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>, RepoError> {
        let query = sqlx::query_as::<_, LockRecord>(
            "SELECT * FROM sweep_expired_project_locks($1)",
        )
        .bind(now);
        self.db_pool
            .with_rw("project_lock", "sweep_expired")
            .fetch_all_as(query)
            .await
    }

    async fn try_acquire(
        &self,
        project_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        metadata: Value,
    ) -> Result<bool, RepoError> {
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| RepoError::Internal(format!("invalid ttl: {e}")))?;
        let query = sqlx::query(
            r#"
              INSERT INTO project_locks
                (project_id, worker_id, acquired_at, renewed_at, expires_at, lock_version, metadata)
              VALUES
                ($1, $2, $3, $3, $4, 1, $5)
              ON CONFLICT (project_id) DO UPDATE
              SET worker_id = EXCLUDED.worker_id,
                  renewed_at = EXCLUDED.renewed_at,
                  expires_at = EXCLUDED.expires_at,
                  lock_version = project_locks.lock_version + 1,
                  acquired_at = CASE
                    WHEN project_locks.worker_id = EXCLUDED.worker_id
                    THEN project_locks.acquired_at
                    ELSE EXCLUDED.acquired_at
                  END,
                  metadata = EXCLUDED.metadata
              WHERE project_locks.worker_id = $2 OR project_locks.expires_at < $3
            "#,
        )
        .bind(project_id)
        .bind(worker_id)
        .bind(now)
        .bind(expires_at)
        .bind(metadata);

        let result = self
            .db_pool
            .with_rw("project_lock", "try_acquire")
            .execute(query)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew(
        &self,
        project_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, RepoError> {
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| RepoError::Internal(format!("invalid ttl: {e}")))?;
        let query = sqlx::query(
            r#"
              UPDATE project_locks
              SET renewed_at = $3, expires_at = $4, lock_version = lock_version + 1
              WHERE project_id = $1 AND worker_id = $2
            "#,
        )
        .bind(project_id)
        .bind(worker_id)
        .bind(now)
        .bind(expires_at);
        let result = self
            .db_pool
            .with_rw("project_lock", "renew")
            .execute(query)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, project_id: &str, worker_id: &str) -> Result<bool, RepoError> {
        let query =
            sqlx::query("DELETE FROM project_locks WHERE project_id = $1 AND worker_id = $2")
                .bind(project_id)
                .bind(worker_id);
        let result = self
            .db_pool
            .with_rw("project_lock", "release")
            .execute(query)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn force_release(&self, project_id: &str) -> Result<bool, RepoError> {
        let query = sqlx::query("DELETE FROM project_locks WHERE project_id = $1").bind(project_id);
        let result = self
            .db_pool
            .with_rw("project_lock", "force_release")
            .execute(query)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, project_id: &str) -> Result<Option<LockRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, LockRecord>("SELECT * FROM project_locks WHERE project_id = $1")
                .bind(project_id);
        self.db_pool
            .with_ro("project_lock", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn get_for_worker(&self, worker_id: &str) -> Result<Vec<LockRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, LockRecord>("SELECT * FROM project_locks WHERE worker_id = $1")
                .bind(worker_id);
        self.db_pool
            .with_ro("project_lock", "get_for_worker")
            .fetch_all_as(query)
            .await
    }
}

/// Same lease semantics as the Postgres repo, under one mutex.
#[derive(Default)]
pub struct InMemoryLockRepo {
    locks: Arc<Mutex<HashMap<String, LockRecord>>>,
}

impl InMemoryLockRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockRepo for InMemoryLockRepo {
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>, RepoError> {
        let mut locks = self.locks.lock().await;
        let expired: Vec<String> = locks
            .values()
            .filter(|record| record.expires_at < now)
            .map(|record| record.project_id.clone())
            .collect();
        let mut swept = Vec::with_capacity(expired.len());
        for project_id in expired {
            if let Some(record) = locks.remove(&project_id) {
                swept.push(record);
            }
        }
        Ok(swept)
    }

    async fn try_acquire(
        &self,
        project_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        metadata: Value,
    ) -> Result<bool, RepoError> {
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| RepoError::Internal(format!("invalid ttl: {e}")))?;
        let mut locks = self.locks.lock().await;
        match locks.get_mut(project_id) {
            None => {
                locks.insert(
                    project_id.to_string(),
                    LockRecord {
                        project_id: project_id.to_string(),
                        worker_id: worker_id.to_string(),
                        acquired_at: now,
                        renewed_at: now,
                        expires_at,
                        lock_version: 1,
                        metadata,
                    },
                );
                Ok(true)
            }
            Some(record) if record.worker_id == worker_id || record.expires_at < now => {
                if record.worker_id != worker_id {
                    record.acquired_at = now;
                }
                record.worker_id = worker_id.to_string();
                record.renewed_at = now;
                record.expires_at = expires_at;
                record.lock_version += 1;
                record.metadata = metadata;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn renew(
        &self,
        project_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, RepoError> {
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| RepoError::Internal(format!("invalid ttl: {e}")))?;
        let mut locks = self.locks.lock().await;
        match locks.get_mut(project_id) {
            Some(record) if record.worker_id == worker_id => {
                record.renewed_at = now;
                record.expires_at = expires_at;
                record.lock_version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, project_id: &str, worker_id: &str) -> Result<bool, RepoError> {
        let mut locks = self.locks.lock().await;
        match locks.get(project_id) {
            Some(record) if record.worker_id == worker_id => {
                locks.remove(project_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release(&self, project_id: &str) -> Result<bool, RepoError> {
        Ok(self.locks.lock().await.remove(project_id).is_some())
    }

    async fn get(&self, project_id: &str) -> Result<Option<LockRecord>, RepoError> {
        Ok(self.locks.lock().await.get(project_id).cloned())
    }

    async fn get_for_worker(&self, worker_id: &str) -> Result<Vec<LockRecord>, RepoError> {
        Ok(self
            .locks
            .lock()
            .await
            .values()
            .filter(|record| record.worker_id == worker_id)
            .cloned()
            .collect())
    }
}
