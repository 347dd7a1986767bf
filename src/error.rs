//! Error taxonomy for a batch run.
use crate::client::ClientError;
use crate::db::LedgerError;
use crate::payload::PayloadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    /// The recipient source selection or its content is unusable. Raised before
    /// any ledger row exists.
    #[error("invalid input: {0}")]
    Input(String),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Transport(#[from] ClientError),
    /// The ledger could not be written or read; progress can no longer be trusted.
    #[error("ledger error: {0}")]
    Storage(#[from] LedgerError),
    /// Abort-on-error stopped the run. The ledger already shows the batch as
    /// `failed`; `source` is the failure that triggered it.
    #[error("batch {batch_id} aborted: {source}")]
    Aborted {
        batch_id: String,
        #[source]
        source: Box<BatchError>,
    },
    #[error("batch {batch_id} cancelled")]
    Cancelled { batch_id: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl BatchError {
    /// Batch id of a run that was stopped after its ledger row was created.
    pub fn batch_id(&self) -> Option<&str> {
        match self {
            BatchError::Aborted { batch_id, .. } | BatchError::Cancelled { batch_id } => {
                Some(batch_id)
            }
            _ => None,
        }
    }
}
