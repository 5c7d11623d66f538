use crate::db::PostgresPool;
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cineforge_common::model::{AssetKind, Job, JobId, JobState, JobType, ProjectId};
use serde_json::Value;
use sqlx::QueryBuilder;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Exponent cap for the backoff window; beyond this the window stops
/// growing instead of overflowing.
const MAX_BACKOFF_EXPONENT: i64 = 20;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub project_id: String,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub state: String,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub unique_key: Option<String>,
    pub asset_key: Option<String>,
    pub attempt: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn job_state(&self) -> Result<JobState, String> {
        JobState::from_str(&self.state).map_err(|_| format!("invalid job state: {}", self.state))
    }

    fn backoff_ready_at(&self) -> DateTime<Utc> {
        let exponent = i64::from(self.attempt.saturating_sub(1)).clamp(0, MAX_BACKOFF_EXPONENT);
        self.updated_at + Duration::minutes(1 << exponent)
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = String;

    fn try_from(value: JobRecord) -> Result<Self, Self::Error> {
        let job_type = JobType::from_str(&value.job_type)
            .map_err(|_| format!("invalid job type: {}", value.job_type))?;
        let state = value.job_state()?;
        let asset_key = value
            .asset_key
            .as_deref()
            .map(|raw| {
                AssetKind::from_str(raw).map_err(|_| format!("invalid asset kind: {raw}"))
            })
            .transpose()?;
        Ok(Job {
            id: JobId(value.id),
            project_id: ProjectId(value.project_id),
            job_type,
            state,
            payload: value.payload,
            result: value.result,
            error: value.error,
            unique_key: value.unique_key,
            asset_key,
            attempt: value.attempt,
            max_retries: value.max_retries,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl From<Job> for JobRecord {
    fn from(value: Job) -> Self {
        Self {
            id: value.id.0,
            project_id: value.project_id.0,
            job_type: value.job_type.to_string(),
            state: value.state.to_string(),
            payload: value.payload,
            result: value.result,
            error: value.error,
            unique_key: value.unique_key,
            asset_key: value.asset_key.map(|kind| kind.to_string()),
            attempt: value.attempt,
            max_retries: value.max_retries,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

/// Optimistic patch applied by `update_safe`. `attempt` is deliberately not
/// representable here; the update itself bumps it.
#[derive(Debug, Clone, Default)]
pub struct JobRowUpdate {
    pub state: Option<String>,
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub set_error: Option<Option<String>>,
    pub append_error: Option<String>,
    /// When set, the update additionally requires the row to still be in
    /// this state. Requeues use it so a row that reached a terminal state
    /// between select and update cannot be pushed back to CREATED.
    pub guard_state: Option<String>,
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Inserts a new row; fails with `UniqueViolation` when another row for
    /// the same `(project_id, type, unique_key)` is still active.
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<JobRecord>, RepoError>;

    /// Most recently created row for the logical address. `None` as
    /// `unique_key` matches singleton jobs (`unique_key IS NULL`).
    async fn get_latest(
        &self,
        project_id: &str,
        job_type: &str,
        unique_key: Option<&str>,
    ) -> Result<Option<JobRecord>, RepoError>;

    /// CREATED -> RUNNING under a per-(project, job) advisory lock and the
    /// per-project RUNNING cap. `None` when any check fails.
    async fn claim(
        &self,
        id: &Uuid,
        max_running_per_project: i64,
    ) -> Result<Option<JobRecord>, RepoError>;

    /// `UPDATE ... SET attempt = attempt + 1, ... WHERE id = ? AND attempt
    /// = ?`. `None` means concurrent modification, not an error.
    async fn update_safe(
        &self,
        id: &Uuid,
        expected_attempt: i32,
        update: JobRowUpdate,
    ) -> Result<Option<JobRecord>, RepoError>;

    /// Unconditional terminal transition used by workers. Moving into
    /// FAILED bumps `attempt`, and lands on FATAL when that exhausts the
    /// retry budget.
    async fn update_state(
        &self,
        id: &Uuid,
        state: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<JobRecord>, RepoError>;

    /// Terminal CANCELLED from any non-terminal state.
    async fn cancel(&self, id: &Uuid) -> Result<Option<JobRecord>, RepoError>;

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<JobRecord>, RepoError>;

    async fn running_count(&self, project_id: &str) -> Result<i64, RepoError>;

    /// RUNNING rows whose `updated_at` is older than the cutoff.
    async fn stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, RepoError>;

    /// FAILED rows whose exponential-backoff window has elapsed at `now`.
    async fn failed_ready_for_backoff(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, RepoError>;
}

pub struct DbJobRepo {
    db_pool: PostgresPool,
}

impl DbJobRepo {
    pub fn new(db_pool: PostgresPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl JobRepo for DbJobRepo {
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, RepoError> {
        let query = sqlx::query_as::<_, JobRecord>(
            r#"
              INSERT INTO jobs
                (id, project_id, type, state, payload, result, error, unique_key,
                 asset_key, attempt, max_retries, created_at, updated_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
              RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.project_id)
        .bind(&record.job_type)
        .bind(&record.state)
        .bind(&record.payload)
        .bind(&record.result)
        .bind(&record.error)
        .bind(&record.unique_key)
        .bind(&record.asset_key)
        .bind(record.attempt)
        .bind(record.max_retries)
        .bind(record.created_at)
        .bind(record.updated_at);

        let inserted = self
            .db_pool
            .with_rw("job", "insert")
            .fetch_optional_as(query)
            .await?;
        inserted.ok_or_else(|| RepoError::Internal("insert returned no row".to_string()))
    }

    async fn get(&self, id: &Uuid) -> Result<Option<JobRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1").bind(id);
        self.db_pool.with_ro("job", "get").fetch_optional_as(query).await
    }

    async fn get_latest(
        &self,
        project_id: &str,
        job_type: &str,
        unique_key: Option<&str>,
    ) -> Result<Option<JobRecord>, RepoError> {
        let query = match unique_key {
            Some(unique_key) => sqlx::query_as::<_, JobRecord>(
                r#"
                  SELECT * FROM jobs
                  WHERE project_id = $1 AND type = $2 AND unique_key = $3
                  ORDER BY created_at DESC
                  LIMIT 1
                "#,
            )
            .bind(project_id)
            .bind(job_type)
            .bind(unique_key),
            None => sqlx::query_as::<_, JobRecord>(
                r#"
                  SELECT * FROM jobs
                  WHERE project_id = $1 AND type = $2 AND unique_key IS NULL
                  ORDER BY created_at DESC
                  LIMIT 1
                "#,
            )
            .bind(project_id)
            .bind(job_type),
        };
        self.db_pool
            .with_ro("job", "get_latest")
            .fetch_optional_as(query)
            .await
    }

    async fn claim(
        &self,
        id: &Uuid,
        max_running_per_project: i64,
    ) -> Result<Option<JobRecord>, RepoError> {
        let id = *id;
        self.db_pool
            .transaction("job", "claim", move |tx| {
                Box::pin(async move {
                    let project_id: Option<String> =
                        sqlx::query_scalar("SELECT project_id FROM jobs WHERE id = $1")
                            .bind(id)
                            .fetch_optional(&mut **tx)
                            .await
                            .map_err(RepoError::from)?;
                    let Some(project_id) = project_id else {
                        return Ok(None);
                    };

                    // One claim decision at a time per (project, job), even
                    // when two workers race on the same dispatch event.
                    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
                        .bind(&project_id)
                        .bind(id.to_string())
                        .execute(&mut **tx)
                        .await
                        .map_err(RepoError::from)?;

                    let running: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM jobs WHERE project_id = $1 AND state = 'RUNNING'",
                    )
                    .bind(&project_id)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::from)?;

                    if running >= max_running_per_project {
                        return Ok(None);
                    }

                    let claimed = sqlx::query_as::<_, JobRecord>(
                        r#"
                          UPDATE jobs
                          SET state = 'RUNNING', updated_at = $2
                          WHERE id = $1 AND state = 'CREATED'
                          RETURNING *
                        "#,
                    )
                    .bind(id)
                    .bind(Utc::now())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(RepoError::from)?;

                    Ok(claimed)
                })
            })
            .await
    }

    async fn update_safe(
        &self,
        id: &Uuid,
        expected_attempt: i32,
        update: JobRowUpdate,
    ) -> Result<Option<JobRecord>, RepoError> {
        let mut builder =
            QueryBuilder::<sqlx::Postgres>::new("UPDATE jobs SET attempt = attempt + 1, updated_at = ");
        builder.push_bind(Utc::now());
        if let Some(state) = &update.state {
            builder.push(", state = ");
            builder.push_bind(state);
        }
        if let Some(payload) = &update.payload {
            builder.push(", payload = ");
            builder.push_bind(payload);
        }
        if let Some(result) = &update.result {
            builder.push(", result = ");
            builder.push_bind(result);
        }
        if let Some(error) = &update.set_error {
            builder.push(", error = ");
            builder.push_bind(error.clone());
        }
        if let Some(audit) = &update.append_error {
            builder.push(", error = COALESCE(error, '') || ");
            builder.push_bind(audit);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND attempt = ");
        builder.push_bind(expected_attempt);
        if let Some(guard_state) = &update.guard_state {
            builder.push(" AND state = ");
            builder.push_bind(guard_state);
        }
        builder.push(" RETURNING *");

        self.db_pool
            .with_rw("job", "update_safe")
            .fetch_optional_as(builder.build_query_as::<JobRecord>())
            .await
    }

    async fn update_state(
        &self,
        id: &Uuid,
        state: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<JobRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobRecord>(
            r#"
              UPDATE jobs
              SET state = CASE
                    WHEN $2 = 'FAILED' AND attempt + 1 >= max_retries THEN 'FATAL'
                    ELSE $2
                  END,
                  attempt = attempt + CASE WHEN $2 = 'FAILED' THEN 1 ELSE 0 END,
                  result = COALESCE($3, result),
                  error = COALESCE($4, error),
                  updated_at = $5
              WHERE id = $1
              RETURNING *
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(result)
        .bind(error)
        .bind(Utc::now());

        self.db_pool
            .with_rw("job", "update_state")
            .fetch_optional_as(query)
            .await
    }

    async fn cancel(&self, id: &Uuid) -> Result<Option<JobRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobRecord>(
            r#"
              UPDATE jobs
              SET state = 'CANCELLED', updated_at = $2
              WHERE id = $1 AND state NOT IN ('COMPLETED', 'FATAL', 'CANCELLED')
              RETURNING *
            "#,
        )
        .bind(id)
        .bind(Utc::now());
        self.db_pool
            .with_rw("job", "cancel")
            .fetch_optional_as(query)
            .await
    }

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<JobRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE project_id = $1 ORDER BY created_at DESC",
        )
        .bind(project_id);
        self.db_pool.with_ro("job", "list").fetch_all_as(query).await
    }

    async fn running_count(&self, project_id: &str) -> Result<i64, RepoError> {
        let query = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE project_id = $1 AND state = 'RUNNING'",
        )
        .bind(project_id);
        self.db_pool
            .with_ro("job", "running_count")
            .fetch_one_scalar(query)
            .await
    }

    async fn stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE state = 'RUNNING' AND updated_at < $1",
        )
        .bind(cutoff);
        self.db_pool
            .with_ro("job", "stale_running")
            .fetch_all_as(query)
            .await
    }

    async fn failed_ready_for_backoff(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobRecord>(
            r#"
              SELECT * FROM jobs
              WHERE state = 'FAILED'
                AND updated_at
                    < $1 - (interval '1 minute' * pow(2, least(greatest(attempt - 1, 0), 20)))
            "#,
        )
        .bind(now);
        self.db_pool
            .with_ro("job", "failed_ready_for_backoff")
            .fetch_all_as(query)
            .await
    }
}

/// Hermetic implementation with the same contracts as the Postgres repo:
/// the active-state unique index, the optimistic attempt guard and the
/// claim-time cap are all enforced under one mutex.
#[derive(Default)]
pub struct InMemoryJobRepo {
    jobs: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
}

impl InMemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: rewrites a row's `updated_at` so sweeps can observe
    /// aged claims without real waiting.
    pub async fn set_updated_at(&self, id: &Uuid, updated_at: DateTime<Utc>) {
        if let Some(record) = self.jobs.lock().await.get_mut(id) {
            record.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl JobRepo for InMemoryJobRepo {
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, RepoError> {
        let mut jobs = self.jobs.lock().await;
        let active_duplicate = jobs.values().any(|existing| {
            existing.project_id == record.project_id
                && existing.job_type == record.job_type
                && existing.unique_key == record.unique_key
                && matches!(existing.state.as_str(), "CREATED" | "RUNNING")
        });
        if active_duplicate {
            return Err(RepoError::UniqueViolation(format!(
                "active job already exists for ({}, {}, {:?})",
                record.project_id, record.job_type, record.unique_key
            )));
        }
        if jobs.contains_key(&record.id) {
            return Err(RepoError::UniqueViolation(format!(
                "job id already exists: {}",
                record.id
            )));
        }
        jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<JobRecord>, RepoError> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn get_latest(
        &self,
        project_id: &str,
        job_type: &str,
        unique_key: Option<&str>,
    ) -> Result<Option<JobRecord>, RepoError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|record| {
                record.project_id == project_id
                    && record.job_type == job_type
                    && record.unique_key.as_deref() == unique_key
            })
            .max_by_key(|record| record.created_at)
            .cloned())
    }

    async fn claim(
        &self,
        id: &Uuid,
        max_running_per_project: i64,
    ) -> Result<Option<JobRecord>, RepoError> {
        let mut jobs = self.jobs.lock().await;
        let Some(project_id) = jobs.get(id).map(|record| record.project_id.clone()) else {
            return Ok(None);
        };
        let running = jobs
            .values()
            .filter(|record| record.project_id == project_id && record.state == "RUNNING")
            .count() as i64;
        if running >= max_running_per_project {
            return Ok(None);
        }
        let Some(record) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if record.state != "CREATED" {
            return Ok(None);
        }
        record.state = "RUNNING".to_string();
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn update_safe(
        &self,
        id: &Uuid,
        expected_attempt: i32,
        update: JobRowUpdate,
    ) -> Result<Option<JobRecord>, RepoError> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if record.attempt != expected_attempt {
            return Ok(None);
        }
        if let Some(guard_state) = &update.guard_state {
            if &record.state != guard_state {
                return Ok(None);
            }
        }
        record.attempt += 1;
        record.updated_at = Utc::now();
        if let Some(state) = update.state {
            record.state = state;
        }
        if let Some(payload) = update.payload {
            record.payload = payload;
        }
        if let Some(result) = update.result {
            record.result = Some(result);
        }
        if let Some(error) = update.set_error {
            record.error = error;
        }
        if let Some(audit) = update.append_error {
            record.error = Some(format!(
                "{}{}",
                record.error.clone().unwrap_or_default(),
                audit
            ));
        }
        Ok(Some(record.clone()))
    }

    async fn update_state(
        &self,
        id: &Uuid,
        state: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<JobRecord>, RepoError> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if state == "FAILED" {
            record.attempt += 1;
            record.state = if record.attempt >= record.max_retries {
                "FATAL".to_string()
            } else {
                "FAILED".to_string()
            };
        } else {
            record.state = state.to_string();
        }
        if let Some(result) = result {
            record.result = Some(result);
        }
        if let Some(error) = error {
            record.error = Some(error);
        }
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn cancel(&self, id: &Uuid) -> Result<Option<JobRecord>, RepoError> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if matches!(record.state.as_str(), "COMPLETED" | "FATAL" | "CANCELLED") {
            return Ok(None);
        }
        record.state = "CANCELLED".to_string();
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<JobRecord>, RepoError> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<JobRecord> = jobs
            .values()
            .filter(|record| record.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn running_count(&self, project_id: &str) -> Result<i64, RepoError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|record| record.project_id == project_id && record.state == "RUNNING")
            .count() as i64)
    }

    async fn stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|record| record.state == "RUNNING" && record.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn failed_ready_for_backoff(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|record| record.state == "FAILED" && record.backoff_ready_at() <= now)
            .cloned()
            .collect())
    }
}
