//! Lifecycle enums for orders, payments, intents and carrier shipments.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Business lifecycle of an order.
///
/// ```text
/// PENDING_PAYMENT ──► PAYMENT_CONFIRMED ──► PROCESSING ──► SHIPPING ──► COMPLETED
///        │   ▲                                  ▲
///        ▼   │ (new intent / unwind)            │ (COD orders start here)
/// PAYMENT_FAILED
///
/// any non-terminal state ──► CANCELLED (until carrier pickup)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    PendingPayment,
    PaymentConfirmed,
    Processing,
    Shipping,
    Completed,
    Cancelled,
    PaymentFailed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Position on the forward fulfilment chain. The payment states share
    /// rank 0; `CANCELLED` is off the chain.
    pub fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::PendingPayment | OrderStatus::PaymentFailed => Some(0),
            OrderStatus::PaymentConfirmed => Some(1),
            OrderStatus::Processing => Some(2),
            OrderStatus::Shipping => Some(3),
            OrderStatus::Completed => Some(4),
            OrderStatus::Cancelled => None,
        }
    }

    /// Whether the order is still waiting for a prepaid payment.
    pub fn awaits_payment(&self) -> bool {
        matches!(
            self,
            OrderStatus::PendingPayment | OrderStatus::PaymentFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::PaymentConfirmed => "PAYMENT_CONFIRMED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipping => "SHIPPING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING_PAYMENT" => Ok(OrderStatus::PendingPayment),
            "PAYMENT_CONFIRMED" => Ok(OrderStatus::PaymentConfirmed),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "SHIPPING" => Ok(OrderStatus::Shipping),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "PAYMENT_FAILED" => Ok(OrderStatus::PaymentFailed),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// Financial lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    /// Captured money has to go back to the payer after a cancellation.
    RefundPending,
}

impl PaymentStatus {
    /// Money was collected at some point (even if a refund is now due).
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::RefundPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::RefundPending => "REFUND_PENDING",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    #[default]
    Created,
    AwaitingCallback,
    Confirmed,
    Failed,
    Expired,
}

impl IntentStatus {
    /// The provider may still complete this attempt.
    pub fn is_live(&self) -> bool {
        matches!(self, IntentStatus::Created | IntentStatus::AwaitingCallback)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Created => "CREATED",
            IntentStatus::AwaitingCallback => "AWAITING_CALLBACK",
            IntentStatus::Confirmed => "CONFIRMED",
            IntentStatus::Failed => "FAILED",
            IntentStatus::Expired => "EXPIRED",
        }
    }
}

/// Shipment state as reported by the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarrierStatus {
    #[default]
    ReadyToPick,
    Picking,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
    Returned,
}

impl CarrierStatus {
    /// The parcel has physically left the shop.
    pub fn is_picked_up(&self) -> bool {
        matches!(
            self,
            CarrierStatus::PickedUp
                | CarrierStatus::InTransit
                | CarrierStatus::Delivered
                | CarrierStatus::Returned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CarrierStatus::ReadyToPick => "READY_TO_PICK",
            CarrierStatus::Picking => "PICKING",
            CarrierStatus::PickedUp => "PICKED_UP",
            CarrierStatus::InTransit => "IN_TRANSIT",
            CarrierStatus::Delivered => "DELIVERED",
            CarrierStatus::Cancelled => "CANCELLED",
            CarrierStatus::Returned => "RETURNED",
        }
    }
}

impl std::fmt::Display for CarrierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::PaymentFailed.is_terminal());
        assert!(!OrderStatus::Shipping.is_terminal());
    }

    #[test]
    fn chain_ranks_are_ordered() {
        let chain = [
            OrderStatus::PendingPayment,
            OrderStatus::PaymentConfirmed,
            OrderStatus::Processing,
            OrderStatus::Shipping,
            OrderStatus::Completed,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
        assert_eq!(OrderStatus::Cancelled.rank(), None);
    }

    #[test]
    fn status_parses_from_admin_input() {
        assert_eq!(
            "processing".parse::<OrderStatus>().unwrap(),
            OrderStatus::Processing
        );
        assert_eq!(
            "payment-failed".parse::<OrderStatus>().unwrap(),
            OrderStatus::PaymentFailed
        );
        assert!("SHIPPED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn pickup_covers_every_post_pickup_state() {
        assert!(!CarrierStatus::ReadyToPick.is_picked_up());
        assert!(!CarrierStatus::Picking.is_picked_up());
        assert!(!CarrierStatus::Cancelled.is_picked_up());
        assert!(CarrierStatus::PickedUp.is_picked_up());
        assert!(CarrierStatus::Delivered.is_picked_up());
        assert!(CarrierStatus::Returned.is_picked_up());
    }

    #[test]
    fn serialized_names_match_wire_format() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::PendingPayment).unwrap(),
            "\"PENDING_PAYMENT\""
        );
        assert_eq!(
            serde_json::to_string(&IntentStatus::AwaitingCallback).unwrap(),
            "\"AWAITING_CALLBACK\""
        );
        assert!(IntentStatus::AwaitingCallback.is_live());
        assert!(!IntentStatus::Expired.is_live());
    }
}
