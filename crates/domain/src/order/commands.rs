//! Order commands.

use common::{AggregateId, PaymentMethod};
use uuid::Uuid;

use crate::command::Command;
use crate::money::Money;

use super::{
    ConfirmationSource, LineItem, Order, OrderStatus, ShippingAddress, ShippingDispatch, UserId,
};

macro_rules! targets_order {
    ($($command:ty),+ $(,)?) => {
        $(
            impl Command for $command {
                type Aggregate = Order;

                fn aggregate_id(&self) -> AggregateId {
                    self.order_id
                }
            }
        )+
    };
}

/// Command to place a new order from a checkout.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub items: Vec<LineItem>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

impl PlaceOrder {
    /// Creates a placement with a freshly generated order ID.
    pub fn new(
        user_id: UserId,
        items: Vec<LineItem>,
        shipping_address: ShippingAddress,
        payment_method: PaymentMethod,
    ) -> Self {
        Self {
            order_id: AggregateId::new(),
            user_id,
            items,
            shipping_address,
            payment_method,
        }
    }
}

/// Records a payment attempt the provider has accepted.
#[derive(Debug, Clone)]
pub struct RecordIntent {
    pub order_id: AggregateId,
    pub intent_id: Uuid,
    pub provider: PaymentMethod,
    pub provider_reference: Option<String>,
    pub amount: Money,
    pub idempotency_key: String,
    pub approval_url: Option<String>,
}

/// Provider-reported collection of money.
#[derive(Debug, Clone)]
pub struct ConfirmPayment {
    pub order_id: AggregateId,
    pub intent_id: Option<Uuid>,
    pub transaction_id: String,
    pub amount: Money,
    pub source: ConfirmationSource,
}

impl ConfirmPayment {
    pub fn new(
        order_id: AggregateId,
        transaction_id: impl Into<String>,
        amount: Money,
        source: ConfirmationSource,
    ) -> Self {
        Self {
            order_id,
            intent_id: None,
            transaction_id: transaction_id.into(),
            amount,
            source,
        }
    }

    pub fn for_intent(mut self, intent_id: Uuid) -> Self {
        self.intent_id = Some(intent_id);
        self
    }
}

/// Provider-reported definitive decline.
#[derive(Debug, Clone)]
pub struct FailPayment {
    pub order_id: AggregateId,
    pub intent_id: Option<Uuid>,
    pub reason: String,
}

impl FailPayment {
    pub fn new(order_id: AggregateId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            intent_id: None,
            reason: reason.into(),
        }
    }

    pub fn for_intent(mut self, intent_id: Uuid) -> Self {
        self.intent_id = Some(intent_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordShipment {
    pub order_id: AggregateId,
    pub dispatch: ShippingDispatch,
}

/// Admin-initiated status change.
#[derive(Debug, Clone)]
pub struct OverrideStatus {
    pub order_id: AggregateId,
    pub to: OrderStatus,
    pub actor: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelOrder {
    pub order_id: AggregateId,
    pub actor: String,
    pub reason: Option<String>,
    /// Set once the carrier confirmed it dropped the shipment.
    pub shipment_cancelled: bool,
}

impl CancelOrder {
    pub fn new(order_id: AggregateId, actor: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            order_id,
            actor: actor.into(),
            reason,
            shipment_cancelled: false,
        }
    }
}

targets_order!(
    PlaceOrder,
    RecordIntent,
    ConfirmPayment,
    FailPayment,
    RecordShipment,
    OverrideStatus,
    CancelOrder,
);
