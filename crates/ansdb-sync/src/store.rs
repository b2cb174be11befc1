//! Persistence seams shared by the Postgres and in-memory stores.

use ansdb_core::{FinancialStatement, KnownOperators, Operator};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Atomic batch write for one record kind.
#[async_trait]
pub trait BatchWriter<R: Send + Sync>: Send + Sync {
    /// Persist every record of `batch` or none of them.
    async fn write_batch(&self, batch: &[R]) -> Result<u64, StoreError>;
}

/// Everything the ingestion pipeline needs from a store.
#[async_trait]
pub trait IngestStore: BatchWriter<Operator> + BatchWriter<FinancialStatement> {
    async fn known_operators(&self) -> Result<KnownOperators, StoreError>;

    async fn statement_count_for_period(&self, periodo: &str) -> Result<i64, StoreError>;
}
