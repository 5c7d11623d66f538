use cineforge_common::config::DbConfig;
use include_dir::Dir;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Failed to connect for migration: {0}")]
    Connect(sqlx::Error),
    #[error("Migration {name} failed: {cause}")]
    Apply { name: String, cause: sqlx::Error },
    #[error("Migration directory entry is not valid UTF-8: {0}")]
    InvalidEntry(String),
}

/// Migrations embedded into the binary at build time, one subdirectory per
/// database flavor.
pub struct IncludedMigrationsDir {
    dir: &'static Dir<'static>,
}

impl IncludedMigrationsDir {
    pub fn new(dir: &'static Dir<'static>) -> Self {
        Self { dir }
    }

    pub fn postgres_migrations(&self) -> &'static Dir<'static> {
        self.dir
            .get_dir("postgres")
            .unwrap_or(self.dir)
    }
}

/// Applies every not-yet-applied `.sql` file in name order. Tracking lives
/// in the `_migrations` table; each file runs in its own transaction.
pub async fn migrate(config: &DbConfig, dir: &Dir<'static>) -> Result<(), MigrationError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.connection_string())
        .await
        .map_err(MigrationError::Connect)?;

    if let Some(schema) = &config.schema {
        pool.execute(format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\"").as_str())
            .await
            .map_err(|cause| MigrationError::Apply {
                name: "create-schema".to_string(),
                cause,
            })?;
        pool.execute(format!("SET search_path TO \"{schema}\"").as_str())
            .await
            .map_err(|cause| MigrationError::Apply {
                name: "set-search-path".to_string(),
                cause,
            })?;
    }

    pool.execute(
        r#"
          CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
          )
        "#,
    )
    .await
    .map_err(|cause| MigrationError::Apply {
        name: "_migrations".to_string(),
        cause,
    })?;

    let mut files: Vec<_> = dir.files().collect();
    files.sort_by_key(|file| file.path().to_path_buf());

    for file in files {
        let name = file
            .path()
            .to_str()
            .ok_or_else(|| MigrationError::InvalidEntry(format!("{:?}", file.path())))?
            .to_string();
        if !name.ends_with(".sql") {
            continue;
        }
        let sql = file
            .contents_utf8()
            .ok_or_else(|| MigrationError::InvalidEntry(name.clone()))?;

        if is_applied(&pool, &name).await.map_err(|cause| MigrationError::Apply {
            name: name.clone(),
            cause,
        })? {
            continue;
        }

        apply_one(&pool, &name, sql)
            .await
            .map_err(|cause| MigrationError::Apply {
                name: name.clone(),
                cause,
            })?;
        info!(migration = %name, "applied migration");
    }

    Ok(())
}

async fn is_applied(pool: &PgPool, name: &str) -> Result<bool, sqlx::Error> {
    let applied: Option<(String,)> =
        sqlx::query_as("SELECT name FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(applied.is_some())
}

async fn apply_one(pool: &PgPool, name: &str, sql: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::Executor::execute(&mut *tx, sql).await?;
    sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}
