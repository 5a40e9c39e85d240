//! Domain error types.

use event_store::EventStoreError;
use thiserror::Error;

use crate::order::OrderError;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The order rejected the command.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Another writer appended to the aggregate first.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            DomainError::EventStore(EventStoreError::ConcurrencyConflict { .. })
        )
    }

    /// Worth retrying later without changing the request.
    pub fn is_transient(&self) -> bool {
        match self {
            DomainError::EventStore(e) => e.is_transient(),
            DomainError::Order(_) | DomainError::Serialization(_) => false,
        }
    }

    /// The order rejection, if this is one.
    pub fn as_order_error(&self) -> Option<&OrderError> {
        match self {
            DomainError::Order(e) => Some(e),
            _ => None,
        }
    }
}
