pub mod circuit_breaker;
pub mod postgres;

pub use circuit_breaker::{CircuitBreaker, CircuitEvent, CircuitState};
pub use postgres::PostgresPool;
