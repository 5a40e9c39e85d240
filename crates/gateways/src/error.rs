use common::PaymentMethod;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors raised by a payment rail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The call did not answer within its deadline. The provider may or may
    /// not have acted on it.
    #[error("Provider call timed out")]
    Timeout,

    /// Connection failure or a 5xx answer.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered and refused the request.
    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: PaymentMethod,
        operation: &'static str,
    },

    #[error("Unknown provider reference '{0}'")]
    UnknownReference(String),

    #[error("No gateway configured for {0}")]
    NotConfigured(PaymentMethod),

    #[error("Invalid gateway configuration: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Whether a later attempt of the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Unavailable(_))
    }

    /// Whether the provider-side effect of the call is unknown, so its
    /// status must be re-queried before anything is retried.
    pub fn is_unknown_outcome(&self) -> bool {
        self.is_transient()
    }
}

impl From<Elapsed> for GatewayError {
    fn from(_: Elapsed) -> Self {
        GatewayError::Timeout
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }
}

/// Errors raised while reading an inbound provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("Malformed callback: {0}")]
    Malformed(String),

    /// The MAC did not match the recomputed value.
    #[error("Callback signature is invalid")]
    InvalidSignature,

    #[error("{0} does not send callbacks")]
    Unsupported(PaymentMethod),
}

/// Errors raised by the shipping carrier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShippingError {
    #[error("Carrier call timed out")]
    Timeout,

    #[error("Carrier unavailable: {0}")]
    Unavailable(String),

    #[error("Carrier rejected the request: {0}")]
    Rejected(String),

    #[error("Shipment '{0}' not found")]
    NotFound(String),

    /// The parcel has left the shop and can no longer be cancelled.
    #[error("Shipment '{0}' has already been picked up")]
    AlreadyPickedUp(String),

    #[error("Invalid carrier response: {0}")]
    InvalidResponse(String),

    #[error("Invalid carrier configuration: {0}")]
    Configuration(String),
}

impl ShippingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ShippingError::Timeout | ShippingError::Unavailable(_))
    }
}

impl From<Elapsed> for ShippingError {
    fn from(_: Elapsed) -> Self {
        ShippingError::Timeout
    }
}

impl From<reqwest::Error> for ShippingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ShippingError::Timeout
        } else if err.is_decode() {
            ShippingError::InvalidResponse(err.to_string())
        } else {
            ShippingError::Unavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_unknown_outcomes() {
        assert!(GatewayError::Timeout.is_unknown_outcome());
        assert!(GatewayError::Unavailable("502".into()).is_transient());
        assert!(!GatewayError::Rejected("INSTRUMENT_DECLINED".into()).is_transient());
        assert!(
            !GatewayError::Unsupported {
                provider: PaymentMethod::Cod,
                operation: "confirm",
            }
            .is_unknown_outcome()
        );
    }

    #[test]
    fn pickup_refusal_is_not_retried() {
        assert!(ShippingError::Timeout.is_transient());
        assert!(!ShippingError::AlreadyPickedUp("GHN1".into()).is_transient());
    }

    #[tokio::test]
    async fn elapsed_deadline_maps_to_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert_eq!(GatewayError::from(elapsed), GatewayError::Timeout);
    }
}
