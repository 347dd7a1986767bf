//! Batch ledger: durable accounting for batch runs.
//!
//! - `repo`: SQL-only functions over the `batches` and `batch_errors` tables.
//!
//! Every mutating call commits before it returns, so the state left behind by
//! a crashed run is always the last completed step.

use crate::model::BatchStatus;
use thiserror::Error;

pub mod repo;

pub use repo::*;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("batch {0} already exists")]
    DuplicateBatch(String),
    #[error("batch {0} not found")]
    NotFound(String),
    #[error("batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        batch_id: String,
        from: BatchStatus,
        to: BatchStatus,
    },
    #[error("counts must be non-negative (sent={sent}, failed={failed})")]
    NegativeCount { sent: i64, failed: i64 },
    #[error("batch {batch_id} has unknown status {status}")]
    UnknownStatus { batch_id: String, status: String },
}
