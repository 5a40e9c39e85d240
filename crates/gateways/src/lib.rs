//! Provider integrations for the order orchestrator.
//!
//! - [`SignatureVerifier`]: HMAC-SHA256 over canonical callback fields,
//!   compared in constant time
//! - [`PaymentGateway`]: the three payment rails behind one contract
//! - [`ShippingDispatchAdapter`]: carrier shipments, created at most once
//!   per order
//!
//! Every outbound call runs under a [`RetryPolicy`] timeout. A timeout is
//! reported as an unknown outcome, never as a failure.

pub mod error;
pub mod payment;
pub mod retry;
pub mod shipping;
pub mod signature;

pub use error::{CallbackError, GatewayError, ShippingError};
pub use payment::{
    CallbackCodec, CallbackNotice, CallbackPayload, CashOnDelivery, ConfirmationResult,
    CreatedIntent, GatewayRegistry, InMemoryRedirectCapture, InMemorySignedCallback, IntentRef,
    IntentRequest, MomoClient, MomoConfig, PayPalClient, PayPalConfig, PaymentGateway,
    ProviderStatus, RedirectCapture, RedirectCaptureApi, SignedCallback, SignedCallbackApi,
};
pub use retry::RetryPolicy;
pub use shipping::{
    CarrierConfig, CarrierShipment, HttpCarrierClient, InMemoryCarrier, ShipmentItem,
    ShipmentRequest, ShippingCarrier, ShippingDispatchAdapter, carrier_status_from,
};
pub use signature::{SignatureVerifier, verify};
