use crate::db::circuit_breaker::{CircuitBreaker, CircuitEvent, CircuitState};
use crate::repo::RepoError;
use cineforge_common::config::DbConfig;
use cineforge_common::metrics::record_db_call;
use futures::future::BoxFuture;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::query::{Query, QueryAs, QueryScalar};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::info;

/// All database access of a service goes through one of these. Every call
/// is labelled for metrics, guarded by the circuit breaker and classified
/// into `RepoError`.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
}

impl PostgresPool {
    pub async fn configured(config: &DbConfig) -> Result<Self, RepoError> {
        let schema = config.schema.clone();
        let options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .after_connect(move |conn, _meta| {
                let schema = schema.clone();
                Box::pin(async move {
                    if let Some(schema) = schema {
                        sqlx::Executor::execute(
                            &mut *conn,
                            format!("SET search_path TO \"{schema}\"").as_str(),
                        )
                        .await?;
                    }
                    Ok(())
                })
            });

        let pool = options
            .connect(&config.connection_string())
            .await
            .map_err(RepoError::from)?;

        info!(
            host = %config.host,
            database = %config.database,
            "connected to postgres"
        );

        Ok(Self {
            pool,
            breaker: Arc::new(CircuitBreaker::new(&config.breaker)),
        })
    }

    /// Wraps an existing pool; used by tests and by the migration runner.
    pub fn from_pool(pool: PgPool, config: &DbConfig) -> Self {
        Self {
            pool,
            breaker: Arc::new(CircuitBreaker::new(&config.breaker)),
        }
    }

    pub fn with_ro(&self, svc: &'static str, api: &'static str) -> LabelledApi<'_> {
        LabelledApi { pool: self, svc, api }
    }

    pub fn with_rw(&self, svc: &'static str, api: &'static str) -> LabelledApi<'_> {
        LabelledApi { pool: self, svc, api }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn subscribe_circuit_events(&self) -> broadcast::Receiver<CircuitEvent> {
        self.breaker.subscribe()
    }

    /// Runs `f` inside BEGIN/COMMIT; any error rolls back, and the client
    /// is released on every path.
    pub async fn transaction<R: Send>(
        &self,
        svc: &'static str,
        api: &'static str,
        f: impl for<'t> FnOnce(
                &'t mut Transaction<'static, Postgres>,
            ) -> BoxFuture<'t, Result<R, RepoError>>
            + Send,
    ) -> Result<R, RepoError> {
        if !self.breaker.allow_call() {
            return Err(RepoError::CircuitOpen);
        }
        let start = Instant::now();
        let result = async {
            let mut tx = self.pool.begin().await.map_err(RepoError::from)?;
            match f(&mut tx).await {
                Ok(value) => {
                    tx.commit().await.map_err(RepoError::from)?;
                    Ok(value)
                }
                Err(error) => {
                    // Rollback failure is subsumed by the original error.
                    let _ = tx.rollback().await;
                    Err(error)
                }
            }
        }
        .await;
        self.observe(svc, api, start, &result);
        result
    }

    fn observe<R>(
        &self,
        svc: &'static str,
        api: &'static str,
        start: Instant,
        result: &Result<R, RepoError>,
    ) {
        let connectivity_failure = match result {
            Ok(_) => false,
            Err(error) => error.is_connectivity(),
        };
        record_db_call(
            svc,
            api,
            start.elapsed().as_secs_f64(),
            !connectivity_failure,
        );
        if connectivity_failure {
            self.breaker.record_failure();
        } else {
            self.breaker.record_success();
        }
    }
}

pub struct LabelledApi<'a> {
    pool: &'a PostgresPool,
    svc: &'static str,
    api: &'static str,
}

impl LabelledApi<'_> {
    pub async fn execute(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, RepoError> {
        let start = self.admit()?;
        let result = query.execute(&self.pool.pool).await.map_err(RepoError::from);
        self.pool.observe(self.svc, self.api, start, &result);
        result
    }

    pub async fn fetch_optional(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<PgRow>, RepoError> {
        let start = self.admit()?;
        let result = query
            .fetch_optional(&self.pool.pool)
            .await
            .map_err(RepoError::from);
        self.pool.observe(self.svc, self.api, start, &result);
        result
    }

    pub async fn fetch_optional_as<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Option<T>, RepoError>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let start = self.admit()?;
        let result = query
            .fetch_optional(&self.pool.pool)
            .await
            .map_err(RepoError::from);
        self.pool.observe(self.svc, self.api, start, &result);
        result
    }

    pub async fn fetch_all_as<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let start = self.admit()?;
        let result = query
            .fetch_all(&self.pool.pool)
            .await
            .map_err(RepoError::from);
        self.pool.observe(self.svc, self.api, start, &result);
        result
    }

    pub async fn fetch_one_scalar<T>(
        &self,
        query: QueryScalar<'_, Postgres, T, PgArguments>,
    ) -> Result<T, RepoError>
    where
        T: Send + Unpin,
        (T,): for<'r> FromRow<'r, PgRow>,
    {
        let start = self.admit()?;
        let result = query
            .fetch_one(&self.pool.pool)
            .await
            .map_err(RepoError::from);
        self.pool.observe(self.svc, self.api, start, &result);
        result
    }

    fn admit(&self) -> Result<Instant, RepoError> {
        if !self.pool.breaker.allow_call() {
            return Err(RepoError::CircuitOpen);
        }
        Ok(Instant::now())
    }
}
