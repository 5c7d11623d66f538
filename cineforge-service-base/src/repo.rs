pub mod checkpoint;
pub mod job;
pub mod lock;
pub mod project;

use cineforge_common::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),
    #[error("Database circuit breaker is open")]
    CircuitOpen,
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Database connection error: {0}")]
    Connection(String),
    #[error("Database error: {0}")]
    Internal(String),
}

impl RepoError {
    /// Connectivity-shaped failures feed the circuit breaker; logical
    /// failures (constraints, bad data) do not. `CircuitOpen` is excluded:
    /// no call was made.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::PoolExhausted(_))
    }
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) => {
                let code = db_error.code().map(|c| c.to_string()).unwrap_or_default();
                if code == "23505" {
                    RepoError::UniqueViolation(db_error.message().to_string())
                } else if code.starts_with("08") || code.starts_with("57P") {
                    RepoError::Connection(error.to_string())
                } else {
                    RepoError::Internal(error.to_string())
                }
            }
            sqlx::Error::PoolTimedOut => RepoError::PoolExhausted(error.to_string()),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
                RepoError::Connection(error.to_string())
            }
            _ => RepoError::Internal(error.to_string()),
        }
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            Self::UniqueViolation(_) => self.to_string(),
            Self::CircuitOpen => self.to_string(),
            Self::PoolExhausted(_) => "Connection pool exhausted".to_string(),
            Self::Connection(_) => "Database connection error".to_string(),
            Self::Internal(_) => "Internal database error".to_string(),
        }
    }
}
