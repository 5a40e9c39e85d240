//! Shared identifiers for the order payment orchestrator.

mod ids;
mod payment_method;

pub use ids::{AggregateId, ParseIdError};
pub use payment_method::{PaymentMethod, UnknownPaymentMethod};
