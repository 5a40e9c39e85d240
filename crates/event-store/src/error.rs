use thiserror::Error;

use crate::{AggregateId, Version};

/// Errors raised by the event log and the receipt table.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer appended to the aggregate first.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// The batch handed to `append` is not a valid contiguous run of events.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// An envelope was built without one of its required fields.
    #[error("Event envelope is missing '{0}'")]
    IncompleteEnvelope(&'static str),

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EventStoreError::ConcurrencyConflict { .. } | EventStoreError::Unavailable(_) => true,
            EventStoreError::Database(err) => !matches!(
                err,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::Decode(_)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EventStoreError>;
