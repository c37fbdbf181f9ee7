//! Commit pipeline errors.

use fleet_id::InstanceId;
use fleet_model::ValidationError;
use fleet_networking::PoolError;
use fleet_store::StoreError;
use thiserror::Error;

/// Errors from a validate-then-commit call.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The document was rejected; nothing was written.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The write failed or the document does not exist.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The write succeeded but releasing the old address failed. Retry the
    /// release; do not retry the write.
    #[error("instance {instance} committed but address release failed: {source}")]
    Cleanup {
        instance: InstanceId,
        #[source]
        source: PoolError,
    },
}

impl CommitError {
    /// Whether persisted state changed despite the error.
    pub fn state_changed(&self) -> bool {
        matches!(self, Self::Cleanup { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_not_found())
    }
}
