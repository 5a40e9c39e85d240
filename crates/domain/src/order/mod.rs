//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod service;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::*;
pub use events::{
    CarrierStatusUpdatedData, OrderCancelledData, OrderCompletedData, OrderEvent, OrderPlacedData,
    PaymentConfirmedData, PaymentFailedData, PaymentIntentCreatedData, PaymentIntentExpiredData,
    PaymentOutcomeUnknownData, ShipmentCreationFailedData, SideEffectData, StatusOverriddenData,
};
pub use service::{ConfirmOutcome, OrderService, PaymentApplied};
pub use state::{CarrierStatus, IntentStatus, OrderStatus, PaymentStatus};
pub use value_objects::{
    ConfirmationSource, DEFAULT_ITEM_WEIGHT_GRAMS, FlagKind, LineItem, Parcel, PaymentIntent,
    ProductId, ReconciliationFlag, ShippingAddress, ShippingDispatch, UserId,
};

use common::PaymentMethod;
use thiserror::Error;
use uuid::Uuid;

use crate::money::MoneyError;

/// Errors that can occur during order operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    #[error("Order not found")]
    NotFound,

    #[error("Order already placed")]
    AlreadyPlaced,

    #[error("Order has no items")]
    NoItems,

    #[error("Invalid quantity for {product_id} (must be greater than 0)")]
    InvalidQuantity { product_id: String },

    #[error("Invalid price for {product_id} (must be greater than 0)")]
    InvalidPrice { product_id: String },

    #[error("Line items use more than one currency")]
    MixedCurrencies,

    #[error("Shipping address is missing {0}")]
    InvalidAddress(&'static str),

    /// Order is not in a state that allows the action.
    #[error("Invalid state transition: cannot {action} from {from} state")]
    InvalidStateTransition {
        from: OrderStatus,
        action: &'static str,
    },

    #[error("Cannot override status from {from} to {to}: {reason}")]
    InvalidOverride {
        from: OrderStatus,
        to: OrderStatus,
        reason: &'static str,
    },

    #[error("Payment confirmation carries no transaction id")]
    MissingTransactionId,

    #[error("Order is already paid")]
    AlreadyPaid,

    #[error("Prepaid order has not been paid")]
    PaymentRequired,

    #[error("Payment intent {intent_id} is still live")]
    LiveIntentExists { intent_id: Uuid },

    #[error("Unknown payment intent {0}")]
    UnknownIntent(Uuid),

    #[error("Order is paid with {expected}, not {got}")]
    MethodMismatch {
        expected: PaymentMethod,
        got: PaymentMethod,
    },

    #[error("Order already has shipment {shipment_code}")]
    ShipmentExists { shipment_code: String },

    #[error("Order has no shipment")]
    NoShipment,

    #[error("Carrier already picked up the shipment")]
    ShipmentAlreadyPickedUp,

    /// Shipment appeared after the cancel request looked; cancel it at the carrier first.
    #[error("Shipment {shipment_code} is still live at the carrier")]
    ShipmentNotCancelled { shipment_code: String },

    #[error(transparent)]
    Money(#[from] MoneyError),
}
