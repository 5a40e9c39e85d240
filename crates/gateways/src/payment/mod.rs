//! Payment rails behind one contract.
//!
//! [`PaymentGateway`] is a tagged enum over the three rails. Callers only
//! see `create_intent`, `confirm`, `query_status` and, for the signed rail,
//! `parse_callback`; the provider request and response shapes stay inside
//! the variant modules.

mod cod;
mod redirect_capture;
mod sandbox;
mod signed_callback;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use common::{AggregateId, PaymentMethod};
use domain::{Currency, Money};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CallbackError, GatewayError};

pub use cod::CashOnDelivery;
pub use redirect_capture::{PayPalClient, PayPalConfig, RedirectCapture, RedirectCaptureApi};
pub use sandbox::{InMemoryRedirectCapture, InMemorySignedCallback};
pub use signed_callback::{
    CallbackCodec, CallbackPayload, MomoClient, MomoConfig, SignedCallback, SignedCallbackApi,
};

/// What a rail needs to open a payment for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub order_id: AggregateId,
    pub intent_id: Uuid,
    /// Amount in the rail's settlement currency.
    pub amount: Money,
    /// Sent to the provider so a retried create does not open a second payment.
    pub idempotency_key: String,
    pub description: String,
}

/// The provider's answer to `create_intent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedIntent {
    pub provider_reference: Option<String>,
    pub approval_url: Option<String>,
    pub amount: Money,
}

/// Identifies a payment at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRef {
    pub order_id: AggregateId,
    pub provider_reference: Option<String>,
}

impl IntentRef {
    pub fn new(order_id: AggregateId, provider_reference: impl Into<String>) -> Self {
        Self {
            order_id,
            provider_reference: Some(provider_reference.into()),
        }
    }

    pub fn reference(&self) -> Result<&str, GatewayError> {
        self.provider_reference
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| GatewayError::UnknownReference(self.order_id.to_string()))
    }
}

/// Definitive or pending answer to a capture/confirm call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConfirmationResult {
    Captured { transaction_id: String, amount: Money },
    Declined { reason: String },
    Pending,
}

/// Provider-side state of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Paid { transaction_id: String, amount: Money },
    Failed { reason: String },
}

impl ProviderStatus {
    pub fn is_definitive(&self) -> bool {
        !matches!(self, ProviderStatus::Pending)
    }
}

impl From<ProviderStatus> for ConfirmationResult {
    fn from(status: ProviderStatus) -> Self {
        match status {
            ProviderStatus::Pending => ConfirmationResult::Pending,
            ProviderStatus::Paid {
                transaction_id,
                amount,
            } => ConfirmationResult::Captured {
                transaction_id,
                amount,
            },
            ProviderStatus::Failed { reason } => ConfirmationResult::Declined { reason },
        }
    }
}

/// A verified, parsed provider callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackNotice {
    pub order_id: AggregateId,
    pub provider_reference: String,
    pub transaction_id: String,
    pub amount: Money,
    pub status: ProviderStatus,
    /// Order and transaction the callback talks about; part of the receipt key.
    pub correlation_key: String,
}

/// One payment rail.
#[derive(Debug, Clone)]
pub enum PaymentGateway {
    CashOnDelivery(CashOnDelivery),
    RedirectCapture(RedirectCapture),
    SignedCallback(SignedCallback),
}

impl PaymentGateway {
    pub fn method(&self) -> PaymentMethod {
        match self {
            PaymentGateway::CashOnDelivery(_) => PaymentMethod::Cod,
            PaymentGateway::RedirectCapture(_) => PaymentMethod::RedirectCapture,
            PaymentGateway::SignedCallback(_) => PaymentMethod::SignedCallback,
        }
    }

    /// Currency the rail charges in. `None` means the order's own currency.
    pub fn settlement_currency(&self) -> Option<Currency> {
        match self {
            PaymentGateway::CashOnDelivery(_) => None,
            PaymentGateway::RedirectCapture(gateway) => Some(gateway.currency()),
            PaymentGateway::SignedCallback(gateway) => Some(gateway.currency()),
        }
    }

    /// Opens a payment. For cash on delivery this is a local record only.
    #[tracing::instrument(skip(self, request), fields(provider = %self.method(), order_id = %request.order_id))]
    pub async fn create_intent(&self, request: &IntentRequest) -> Result<CreatedIntent, GatewayError> {
        let started = Instant::now();
        let result = match self {
            PaymentGateway::CashOnDelivery(gateway) => Ok(gateway.create_intent(request)),
            PaymentGateway::RedirectCapture(gateway) => gateway.create_intent(request).await,
            PaymentGateway::SignedCallback(gateway) => gateway.create_intent(request).await,
        };
        self.observe("create_intent", started, &result);
        result
    }

    /// Captures or confirms a payment.
    ///
    /// Redirect-capture rails capture synchronously. The signed-callback
    /// rail answers with the provider's current status. Cash on delivery
    /// has nothing to confirm.
    #[tracing::instrument(skip(self, intent), fields(provider = %self.method(), order_id = %intent.order_id))]
    pub async fn confirm(&self, intent: &IntentRef) -> Result<ConfirmationResult, GatewayError> {
        let started = Instant::now();
        let result = match self {
            PaymentGateway::CashOnDelivery(_) => Err(GatewayError::Unsupported {
                provider: PaymentMethod::Cod,
                operation: "confirm",
            }),
            PaymentGateway::RedirectCapture(gateway) => gateway.capture(intent).await,
            PaymentGateway::SignedCallback(gateway) => {
                gateway.query_status(intent).await.map(ConfirmationResult::from)
            }
        };
        self.observe("confirm", started, &result);
        result
    }

    #[tracing::instrument(skip(self, intent), fields(provider = %self.method(), order_id = %intent.order_id))]
    pub async fn query_status(&self, intent: &IntentRef) -> Result<ProviderStatus, GatewayError> {
        let started = Instant::now();
        let result = match self {
            PaymentGateway::CashOnDelivery(_) => Ok(ProviderStatus::Pending),
            PaymentGateway::RedirectCapture(gateway) => gateway.query_status(intent).await,
            PaymentGateway::SignedCallback(gateway) => gateway.query_status(intent).await,
        };
        self.observe("query_status", started, &result);
        result
    }

    /// Verifies and parses a callback body. Only the signed rail sends them.
    pub fn parse_callback(&self, body: &[u8]) -> Result<CallbackNotice, CallbackError> {
        match self {
            PaymentGateway::SignedCallback(gateway) => gateway.parse_callback(body),
            other => Err(CallbackError::Unsupported(other.method())),
        }
    }

    fn observe<T>(&self, operation: &'static str, started: Instant, result: &Result<T, GatewayError>) {
        metrics::histogram!(
            "provider_call_duration_seconds",
            "provider" => self.method().as_str(),
            "operation" => operation
        )
        .record(started.elapsed().as_secs_f64());
        if let Err(err) = result {
            tracing::warn!(operation, error = %err, "provider call failed");
        }
    }
}

/// The configured rails, keyed by method. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentMethod, Arc<PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gateway: PaymentGateway) -> Self {
        self.gateways.insert(gateway.method(), Arc::new(gateway));
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Result<Arc<PaymentGateway>, GatewayError> {
        self.gateways
            .get(&method)
            .cloned()
            .ok_or(GatewayError::NotConfigured(method))
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        PaymentMethod::ALL
            .into_iter()
            .filter(|m| self.gateways.contains_key(m))
            .collect()
    }
}
