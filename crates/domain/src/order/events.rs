//! Order domain events.

use chrono::{DateTime, Utc};
use common::{AggregateId, PaymentMethod};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::DomainEvent;
use crate::money::Money;

use super::{
    CarrierStatus, ConfirmationSource, FlagKind, LineItem, OrderStatus, ReconciliationFlag,
    ShippingAddress, ShippingDispatch, UserId,
};

/// Events recorded on an order stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    /// Checkout produced the order.
    OrderPlaced(OrderPlacedData),

    /// A provider accepted a new payment attempt.
    PaymentIntentCreated(PaymentIntentCreatedData),

    /// A capture or create call ended without a definitive answer.
    PaymentOutcomeUnknown(PaymentOutcomeUnknownData),

    /// A live intent ran out of time or was superseded.
    PaymentIntentExpired(PaymentIntentExpiredData),

    /// Money was collected.
    PaymentConfirmed(PaymentConfirmedData),

    /// The provider definitively declined the payment.
    PaymentFailed(PaymentFailedData),

    /// Something operators have to look at.
    ReconciliationFlagged(ReconciliationFlag),

    CartCleared(SideEffectData),

    StockCommitted(SideEffectData),

    /// The carrier accepted the shipment.
    ShipmentCreated(ShippingDispatch),

    /// Shipment creation gave up after retries; payment is unaffected.
    ShipmentCreationFailed(ShipmentCreationFailedData),

    CarrierStatusUpdated(CarrierStatusUpdatedData),

    /// An admin moved the order by hand.
    StatusOverridden(StatusOverriddenData),

    OrderCancelled(OrderCancelledData),

    /// The order reached COMPLETED; nothing further happens to it.
    OrderCompleted(OrderCompletedData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "OrderPlaced",
            OrderEvent::PaymentIntentCreated(_) => "PaymentIntentCreated",
            OrderEvent::PaymentOutcomeUnknown(_) => "PaymentOutcomeUnknown",
            OrderEvent::PaymentIntentExpired(_) => "PaymentIntentExpired",
            OrderEvent::PaymentConfirmed(_) => "PaymentConfirmed",
            OrderEvent::PaymentFailed(_) => "PaymentFailed",
            OrderEvent::ReconciliationFlagged(_) => "ReconciliationFlagged",
            OrderEvent::CartCleared(_) => "CartCleared",
            OrderEvent::StockCommitted(_) => "StockCommitted",
            OrderEvent::ShipmentCreated(_) => "ShipmentCreated",
            OrderEvent::ShipmentCreationFailed(_) => "ShipmentCreationFailed",
            OrderEvent::CarrierStatusUpdated(_) => "CarrierStatusUpdated",
            OrderEvent::StatusOverridden(_) => "StatusOverridden",
            OrderEvent::OrderCancelled(_) => "OrderCancelled",
            OrderEvent::OrderCompleted(_) => "OrderCompleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedData {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub items: Vec<LineItem>,
    pub total: Money,
    pub payment_method: PaymentMethod,
    pub shipping_address: ShippingAddress,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentCreatedData {
    pub intent_id: Uuid,
    pub provider: PaymentMethod,
    pub provider_reference: Option<String>,
    pub amount: Money,
    pub idempotency_key: String,
    pub approval_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutcomeUnknownData {
    pub intent_id: Uuid,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentExpiredData {
    pub intent_id: Uuid,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfirmedData {
    /// Intent the confirmation belongs to, when the caller knows it.
    pub intent_id: Option<Uuid>,
    pub transaction_id: String,
    /// Amount as received from the provider, in its own currency.
    pub amount: Money,
    pub source: ConfirmationSource,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub intent_id: Option<Uuid>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffectData {
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentCreationFailedData {
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierStatusUpdatedData {
    pub status: CarrierStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusOverriddenData {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub overridden_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub actor: String,
    pub reason: Option<String>,
    /// Money was already collected and has to be returned.
    pub refund_required: bool,
    /// The carrier confirmed the shipment cancellation.
    pub shipment_cancelled: bool,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCompletedData {
    pub completed_at: DateTime<Utc>,
}

impl OrderEvent {
    pub fn payment_outcome_unknown(intent_id: Uuid, reason: impl Into<String>) -> Self {
        OrderEvent::PaymentOutcomeUnknown(PaymentOutcomeUnknownData {
            intent_id,
            reason: reason.into(),
            recorded_at: Utc::now(),
        })
    }

    pub fn payment_intent_expired(intent_id: Uuid) -> Self {
        OrderEvent::PaymentIntentExpired(PaymentIntentExpiredData {
            intent_id,
            expired_at: Utc::now(),
        })
    }

    pub fn payment_failed(intent_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        OrderEvent::PaymentFailed(PaymentFailedData {
            intent_id,
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn reconciliation_flagged(
        kind: FlagKind,
        transaction_id: impl Into<String>,
        expected: Money,
        received: Money,
    ) -> Self {
        OrderEvent::ReconciliationFlagged(ReconciliationFlag {
            kind,
            transaction_id: transaction_id.into(),
            expected,
            received,
            raised_at: Utc::now(),
        })
    }

    pub fn cart_cleared() -> Self {
        OrderEvent::CartCleared(SideEffectData {
            recorded_at: Utc::now(),
        })
    }

    pub fn stock_committed() -> Self {
        OrderEvent::StockCommitted(SideEffectData {
            recorded_at: Utc::now(),
        })
    }

    pub fn shipment_creation_failed(reason: impl Into<String>, attempts: u32) -> Self {
        OrderEvent::ShipmentCreationFailed(ShipmentCreationFailedData {
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        })
    }

    pub fn carrier_status_updated(status: CarrierStatus) -> Self {
        OrderEvent::CarrierStatusUpdated(CarrierStatusUpdatedData {
            status,
            updated_at: Utc::now(),
        })
    }

    pub fn order_completed() -> Self {
        OrderEvent::OrderCompleted(OrderCompletedData {
            completed_at: Utc::now(),
        })
    }

    /// Whether this event is the flag of the given kind.
    pub fn is_flag(&self, kind: FlagKind) -> bool {
        matches!(self, OrderEvent::ReconciliationFlagged(flag) if flag.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    #[test]
    fn event_types_match_stream_names() {
        assert_eq!(OrderEvent::cart_cleared().event_type(), "CartCleared");
        assert_eq!(OrderEvent::stock_committed().event_type(), "StockCommitted");
        assert_eq!(
            OrderEvent::payment_failed(None, "declined").event_type(),
            "PaymentFailed"
        );
        assert_eq!(
            OrderEvent::carrier_status_updated(CarrierStatus::PickedUp).event_type(),
            "CarrierStatusUpdated"
        );
        assert_eq!(OrderEvent::order_completed().event_type(), "OrderCompleted");
    }

    #[test]
    fn confirmed_event_survives_storage_format() {
        let event = OrderEvent::PaymentConfirmed(PaymentConfirmedData {
            intent_id: Some(Uuid::new_v4()),
            transaction_id: "4088114551".into(),
            amount: Money::new(170_500, Currency::Vnd),
            source: ConfirmationSource::Webhook,
            confirmed_at: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PaymentConfirmed");
        assert_eq!(json["data"]["source"], "webhook");
        assert_eq!(json["data"]["amount"]["currency"], "VND");

        let back: OrderEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn flag_kind_is_visible_on_the_event() {
        let money = Money::new(170_500, Currency::Vnd);
        let flag = OrderEvent::reconciliation_flagged(
            FlagKind::AmountMismatch,
            "T-1",
            money,
            Money::new(100_000, Currency::Vnd),
        );
        assert!(flag.is_flag(FlagKind::AmountMismatch));
        assert!(!flag.is_flag(FlagKind::DuplicatePayment));
    }
}
