//! Orchestrator error types.

use common::AggregateId;
use domain::{DomainError, Money, OrderError};
use event_store::EventStoreError;
use gateways::{GatewayError, ShippingError};
use thiserror::Error;

/// Coarse classification used by callers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request, amount mismatch, unknown intent. Never applied.
    Validation,
    NotFound,
    /// Bad callback signature. Never advances state.
    Authenticity,
    /// External provider or carrier failed.
    Provider,
    /// The order is in a state that does not allow the transition.
    Conflict,
    /// Local persistence is unreachable.
    Unavailable,
    Internal,
}

/// Errors that can occur while driving an order.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Order {0} not found")]
    OrderNotFound(AggregateId),

    #[error("Invalid request: {0}")]
    Validation(String),

    /// The confirmation was flagged for operators and not applied.
    #[error("Payment amount {received} does not match order total {expected}")]
    AmountMismatch { expected: Money, received: Money },

    #[error("Callback signature is invalid")]
    InvalidSignature,

    /// Money arrived for a cancelled order; flagged, not applied.
    #[error("Order {0} is cancelled; payment was flagged for refund review")]
    PaymentAfterCancellation(AggregateId),

    /// The order rejected the transition.
    #[error(transparent)]
    Rejected(OrderError),

    #[error("Payment provider error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Carrier error: {0}")]
    Shipping(#[from] ShippingError),

    #[error("Storefront error: {0}")]
    Storefront(String),

    #[error("Store error: {0}")]
    Store(#[from] EventStoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DomainError> for OrchestratorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Order(e) => OrchestratorError::Rejected(e),
            DomainError::EventStore(e) => OrchestratorError::Store(e),
            DomainError::Serialization(e) => OrchestratorError::Serialization(e),
        }
    }
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::OrderNotFound(_) => ErrorClass::NotFound,
            OrchestratorError::Validation(_) | OrchestratorError::AmountMismatch { .. } => {
                ErrorClass::Validation
            }
            OrchestratorError::InvalidSignature => ErrorClass::Authenticity,
            OrchestratorError::PaymentAfterCancellation(_) => ErrorClass::Conflict,
            OrchestratorError::Rejected(err) => match err {
                OrderError::NotFound => ErrorClass::NotFound,
                OrderError::NoItems
                | OrderError::InvalidQuantity { .. }
                | OrderError::InvalidPrice { .. }
                | OrderError::MixedCurrencies
                | OrderError::InvalidAddress(_)
                | OrderError::MissingTransactionId
                | OrderError::UnknownIntent(_)
                | OrderError::MethodMismatch { .. }
                | OrderError::Money(_) => ErrorClass::Validation,
                OrderError::AlreadyPlaced
                | OrderError::InvalidStateTransition { .. }
                | OrderError::InvalidOverride { .. }
                | OrderError::AlreadyPaid
                | OrderError::PaymentRequired
                | OrderError::LiveIntentExists { .. }
                | OrderError::ShipmentExists { .. }
                | OrderError::NoShipment
                | OrderError::ShipmentAlreadyPickedUp
                | OrderError::ShipmentNotCancelled { .. } => ErrorClass::Conflict,
            },
            OrchestratorError::Gateway(err) => match err {
                GatewayError::NotConfigured(_) | GatewayError::Unsupported { .. } => {
                    ErrorClass::Validation
                }
                GatewayError::UnknownReference(_) => ErrorClass::NotFound,
                GatewayError::Configuration(_) => ErrorClass::Internal,
                _ => ErrorClass::Provider,
            },
            OrchestratorError::Shipping(err) => match err {
                ShippingError::AlreadyPickedUp(_) => ErrorClass::Conflict,
                ShippingError::NotFound(_) => ErrorClass::NotFound,
                ShippingError::Configuration(_) => ErrorClass::Internal,
                _ => ErrorClass::Provider,
            },
            OrchestratorError::Storefront(_) => ErrorClass::Provider,
            OrchestratorError::Store(err) if err.is_transient() => ErrorClass::Unavailable,
            OrchestratorError::Store(_) | OrchestratorError::Serialization(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Gateway(err) => err.is_transient(),
            OrchestratorError::Shipping(err) => err.is_transient(),
            OrchestratorError::Store(err) => err.is_transient(),
            OrchestratorError::Storefront(_) => true,
            _ => false,
        }
    }

    pub(crate) fn rejected_or_missing(err: DomainError, order_id: AggregateId) -> Self {
        match err {
            DomainError::Order(OrderError::NotFound) => OrchestratorError::OrderNotFound(order_id),
            other => other.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Currency, OrderStatus};

    #[test]
    fn taxonomy() {
        let mismatch = OrchestratorError::AmountMismatch {
            expected: Money::new(170_500, Currency::Vnd),
            received: Money::new(100_000, Currency::Vnd),
        };
        assert_eq!(mismatch.class(), ErrorClass::Validation);
        assert!(!mismatch.is_retryable());

        assert_eq!(
            OrchestratorError::InvalidSignature.class(),
            ErrorClass::Authenticity
        );

        let override_rejected = OrchestratorError::Rejected(OrderError::InvalidOverride {
            from: OrderStatus::Shipping,
            to: OrderStatus::Processing,
            reason: "prepaid order already shipped",
        });
        assert_eq!(override_rejected.class(), ErrorClass::Conflict);

        let timeout = OrchestratorError::from(GatewayError::Timeout);
        assert_eq!(timeout.class(), ErrorClass::Provider);
        assert!(timeout.is_retryable());

        let declined = OrchestratorError::from(GatewayError::Rejected("card".into()));
        assert!(!declined.is_retryable());
    }

    #[test]
    fn store_outage_is_retryable() {
        let err = OrchestratorError::from(DomainError::from(EventStoreError::Unavailable(
            "down".into(),
        )));
        assert_eq!(err.class(), ErrorClass::Unavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_order_carries_its_id() {
        let order_id = AggregateId::new();
        let err = OrchestratorError::rejected_or_missing(
            DomainError::Order(OrderError::NotFound),
            order_id,
        );
        assert!(matches!(err, OrchestratorError::OrderNotFound(id) if id == order_id));
    }
}
