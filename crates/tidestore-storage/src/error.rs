//! Storage Error Types
//!
//! Errors raised on the ingest path between the log and the store.
//!
//! ## Failure Classes
//!
//! Every error maps to a [`FailureClass`] that decides how the coordinator
//! reacts:
//!
//! - **TransientMessage**: the message is dropped and counted, consumption continues
//! - **PartitionFatal**: the current generation is torn down and rebuilt
//! - **StoreFatal**: as above, and the store connection is recreated
//! - **LivenessFatal**: commits stalled; handled like a store failure
//!
//! None of them terminate the process. After a rebuild, consumption resumes
//! from the last committed offsets.

use std::time::Duration;

use thiserror::Error;
use tidestore_core::{CoreError, EnvelopeError};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Log client error: {0}")]
    Log(String),

    #[error("Store I/O error: {0}")]
    Store(String),

    /// At least one write of a batch failed or returned no result.
    #[error("Batch write rejected: {failed} of {total} writes failed")]
    BatchRejected { failed: usize, total: usize },

    #[error("Force flush failed: {0}")]
    ForceFlush(String),

    #[error("Deletes require a row key modulus of 1, configured modulus is {0}")]
    DeleteUnsupportedModulus(i64),

    #[error("Unimplemented message kind: {0}")]
    Unimplemented(&'static str),

    #[error("Interrupted by generation abort")]
    Interrupted,

    #[error("Commit barrier not released within {0:?}")]
    BarrierTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How a failure propagates through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    TransientMessage,
    PartitionFatal,
    StoreFatal,
    LivenessFatal,
}

impl FailureClass {
    /// Whether the store connection must be recreated before the next generation.
    pub fn resets_store(&self) -> bool {
        matches!(self, FailureClass::StoreFatal | FailureClass::LivenessFatal)
    }
}

impl StorageError {
    pub fn class(&self) -> FailureClass {
        match self {
            StorageError::Envelope(_) => FailureClass::TransientMessage,
            StorageError::Store(_)
            | StorageError::BatchRejected { .. }
            | StorageError::ForceFlush(_) => FailureClass::StoreFatal,
            StorageError::BarrierTimeout(_) => FailureClass::LivenessFatal,
            StorageError::Core(_)
            | StorageError::Log(_)
            | StorageError::DeleteUnsupportedModulus(_)
            | StorageError::Unimplemented(_)
            | StorageError::Interrupted
            | StorageError::Config(_) => FailureClass::PartitionFatal,
        }
    }
}
