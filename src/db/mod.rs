//! Durable (relational) side of the sync engine

pub mod backend;
#[cfg(feature = "postgres")]
mod postgres;
pub mod sanitize;
pub mod sql;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use backend::{DurableStore, Row, SqlDialect, SqlValue, Statement};
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
pub use sanitize::SqlSanitizeError;
pub use sql::{OnConflict, SqlBuilder};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
