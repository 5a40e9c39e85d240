//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::{AggregateId, PaymentMethod};
use event_store::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::money::{AmountPolicy, Money};

use super::{
    CancelOrder, CarrierStatus, ConfirmPayment, FailPayment, FlagKind, IntentStatus, LineItem,
    OrderError, OrderEvent, OrderStatus, OverrideStatus, PaymentIntent, PaymentStatus,
    PlaceOrder, ReconciliationFlag, RecordIntent, RecordShipment, ShippingAddress,
    ShippingDispatch, UserId,
    events::{
        OrderCancelledData, OrderPlacedData, PaymentConfirmedData, PaymentIntentCreatedData,
        StatusOverriddenData,
    },
};

/// Order aggregate root.
///
/// Holds the business status, the financial status, every payment attempt,
/// the carrier shipment and the operator flags of one purchase. Every
/// command method only decides; state changes happen in [`Aggregate::apply`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    id: Option<AggregateId>,

    #[serde(default)]
    version: Version,

    user_id: Option<UserId>,
    items: Vec<LineItem>,
    total: Money,
    status: OrderStatus,
    payment_status: PaymentStatus,
    payment_method: Option<PaymentMethod>,
    shipping_address: Option<ShippingAddress>,
    intents: Vec<PaymentIntent>,

    /// Provider transaction that settled the order.
    transaction_id: Option<String>,
    dispatch: Option<ShippingDispatch>,
    flags: Vec<ReconciliationFlag>,

    shipment_pending: bool,
    shipment_failures: u32,
    last_shipment_error: Option<String>,
    cart_cleared: bool,
    stock_committed: bool,
    refund_required: bool,

    created_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderPlaced(data) => self.apply_placed(data),
            OrderEvent::PaymentIntentCreated(data) => self.apply_intent_created(data),
            OrderEvent::PaymentOutcomeUnknown(data) => {
                self.set_intent_status(
                    data.intent_id,
                    IntentStatus::AwaitingCallback,
                    data.recorded_at,
                );
                self.touch(data.recorded_at);
            }
            OrderEvent::PaymentIntentExpired(data) => {
                self.set_intent_status(data.intent_id, IntentStatus::Expired, data.expired_at);
                self.touch(data.expired_at);
            }
            OrderEvent::PaymentConfirmed(data) => self.apply_confirmed(data),
            OrderEvent::PaymentFailed(data) => {
                self.status = OrderStatus::PaymentFailed;
                self.payment_status = PaymentStatus::Failed;
                match data.intent_id {
                    Some(id) => self.set_intent_status(id, IntentStatus::Failed, data.failed_at),
                    None => self.settle_live_intents(IntentStatus::Failed, data.failed_at),
                }
                self.touch(data.failed_at);
            }
            OrderEvent::ReconciliationFlagged(flag) => {
                let raised_at = flag.raised_at;
                if !self.has_flag(flag.kind, &flag.transaction_id) {
                    self.flags.push(flag);
                }
                self.touch(raised_at);
            }
            OrderEvent::CartCleared(data) => {
                self.cart_cleared = true;
                self.touch(data.recorded_at);
            }
            OrderEvent::StockCommitted(data) => {
                self.stock_committed = true;
                self.touch(data.recorded_at);
            }
            OrderEvent::ShipmentCreated(dispatch) => {
                let created_at = dispatch.created_at;
                self.dispatch = Some(dispatch);
                self.shipment_pending = false;
                self.last_shipment_error = None;
                if self.status == OrderStatus::PaymentConfirmed {
                    self.status = OrderStatus::Processing;
                }
                self.touch(created_at);
            }
            OrderEvent::ShipmentCreationFailed(data) => {
                self.shipment_pending = true;
                self.shipment_failures = self.shipment_failures.saturating_add(data.attempts);
                self.last_shipment_error = Some(data.reason);
                if self.status == OrderStatus::PaymentConfirmed {
                    self.status = OrderStatus::Processing;
                }
                self.touch(data.failed_at);
            }
            OrderEvent::CarrierStatusUpdated(data) => {
                if let Some(dispatch) = self.dispatch.as_mut() {
                    dispatch.carrier_status = data.status;
                }
                if data.status.is_picked_up()
                    && matches!(
                        self.status,
                        OrderStatus::PaymentConfirmed | OrderStatus::Processing
                    )
                {
                    self.status = OrderStatus::Shipping;
                }
                self.touch(data.updated_at);
            }
            OrderEvent::StatusOverridden(data) => {
                self.status = data.to;
                if data.to == OrderStatus::PendingPayment {
                    self.payment_status = PaymentStatus::Pending;
                }
                self.touch(data.overridden_at);
            }
            OrderEvent::OrderCancelled(data) => self.apply_cancelled(data),
            OrderEvent::OrderCompleted(data) => {
                self.status = OrderStatus::Completed;
                self.touch(data.completed_at);
            }
        }
    }
}

// Query methods
impl Order {
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        self.payment_method
    }

    /// True for placed orders paid before shipping.
    pub fn is_prepaid(&self) -> bool {
        self.payment_method.is_some_and(|m| m.is_prepaid())
    }

    pub fn is_cod(&self) -> bool {
        self.payment_method == Some(PaymentMethod::Cod)
    }

    pub fn shipping_address(&self) -> Option<&ShippingAddress> {
        self.shipping_address.as_ref()
    }

    pub fn intents(&self) -> &[PaymentIntent] {
        &self.intents
    }

    pub fn intent(&self, intent_id: Uuid) -> Option<&PaymentIntent> {
        self.intents.iter().find(|i| i.intent_id == intent_id)
    }

    /// The attempt the provider may still complete, if any.
    pub fn live_intent(&self) -> Option<&PaymentIntent> {
        self.intents.iter().rev().find(|i| i.status.is_live())
    }

    pub fn latest_intent(&self) -> Option<&PaymentIntent> {
        self.intents.last()
    }

    pub fn intent_by_reference(&self, provider_reference: &str) -> Option<&PaymentIntent> {
        self.intents
            .iter()
            .rev()
            .find(|i| i.provider_reference.as_deref() == Some(provider_reference))
    }

    /// One-based number of the next payment attempt.
    pub fn next_intent_attempt(&self) -> usize {
        self.intents.len() + 1
    }

    pub fn confirmed_intent_count(&self) -> usize {
        self.intents
            .iter()
            .filter(|i| i.status == IntentStatus::Confirmed)
            .count()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn dispatch(&self) -> Option<&ShippingDispatch> {
        self.dispatch.as_ref()
    }

    /// The parcel physically left the shop.
    pub fn is_picked_up(&self) -> bool {
        self.status == OrderStatus::Shipping
            || self
                .dispatch
                .as_ref()
                .is_some_and(|d| d.carrier_status.is_picked_up())
    }

    pub fn flags(&self) -> &[ReconciliationFlag] {
        &self.flags
    }

    pub fn has_flag(&self, kind: FlagKind, transaction_id: &str) -> bool {
        self.flags
            .iter()
            .any(|f| f.kind == kind && f.transaction_id == transaction_id)
    }

    pub fn shipment_pending(&self) -> bool {
        self.shipment_pending
    }

    pub fn shipment_failures(&self) -> u32 {
        self.shipment_failures
    }

    pub fn last_shipment_error(&self) -> Option<&str> {
        self.last_shipment_error.as_deref()
    }

    pub fn cart_cleared(&self) -> bool {
        self.cart_cleared
    }

    pub fn stock_committed(&self) -> bool {
        self.stock_committed
    }

    pub fn refund_required(&self) -> bool {
        self.refund_required
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The order is ready to ship: COD from placement, prepaid once paid.
    pub fn is_shippable(&self) -> bool {
        self.id.is_some()
            && !self.status.is_terminal()
            && (self.is_cod() || self.payment_status == PaymentStatus::Paid)
    }

    /// Some settlement side effect (cart, stock, shipment) is still missing.
    pub fn needs_settlement(&self) -> bool {
        self.is_shippable()
            && (!self.cart_cleared || !self.stock_committed || self.dispatch.is_none())
    }
}

// Command methods (return events)
impl Order {
    /// Validates a checkout and records the order.
    pub fn place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyPlaced);
        }

        let first = cmd.items.first().ok_or(OrderError::NoItems)?;
        let currency = first.unit_price.currency();
        let mut total = Money::zero(currency);

        for item in &cmd.items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: item.product_id.to_string(),
                });
            }
            if !item.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    product_id: item.product_id.to_string(),
                });
            }
            if item.unit_price.currency() != currency {
                return Err(OrderError::MixedCurrencies);
            }
            total = total.checked_add(item.line_total()?)?;
        }

        if let Some(field) = cmd.shipping_address.missing_field() {
            return Err(OrderError::InvalidAddress(field));
        }

        Ok(vec![OrderEvent::OrderPlaced(OrderPlacedData {
            order_id: cmd.order_id,
            user_id: cmd.user_id,
            items: cmd.items.clone(),
            total,
            payment_method: cmd.payment_method,
            shipping_address: cmd.shipping_address.clone(),
            placed_at: Utc::now(),
        })])
    }

    /// Records a payment attempt accepted by the provider.
    pub fn record_intent(&self, cmd: &RecordIntent) -> Result<Vec<OrderEvent>, OrderError> {
        let method = self.placed_method()?;
        if self.status.is_terminal() {
            return Err(self.invalid("open payment"));
        }
        if self.payment_status.is_settled() {
            return Err(OrderError::AlreadyPaid);
        }
        if cmd.provider != method {
            return Err(OrderError::MethodMismatch {
                expected: method,
                got: cmd.provider,
            });
        }
        if !method.is_prepaid() || !self.status.awaits_payment() {
            return Err(self.invalid("open payment"));
        }
        if let Some(live) = self.live_intent() {
            return Err(OrderError::LiveIntentExists {
                intent_id: live.intent_id,
            });
        }

        Ok(vec![OrderEvent::PaymentIntentCreated(
            PaymentIntentCreatedData {
                intent_id: cmd.intent_id,
                provider: cmd.provider,
                provider_reference: cmd.provider_reference.clone(),
                amount: cmd.amount,
                idempotency_key: cmd.idempotency_key.clone(),
                approval_url: cmd.approval_url.clone(),
                created_at: Utc::now(),
            },
        )])
    }

    /// Marks a live intent as waiting for the provider to tell us the result.
    pub fn mark_outcome_unknown(
        &self,
        intent_id: Uuid,
        reason: &str,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        let intent = self
            .intent(intent_id)
            .ok_or(OrderError::UnknownIntent(intent_id))?;

        if intent.status != IntentStatus::Created {
            return Ok(vec![]);
        }
        Ok(vec![OrderEvent::payment_outcome_unknown(intent_id, reason)])
    }

    pub fn expire_intent(&self, intent_id: Uuid) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        let intent = self
            .intent(intent_id)
            .ok_or(OrderError::UnknownIntent(intent_id))?;

        if !intent.status.is_live() {
            return Ok(vec![]);
        }
        Ok(vec![OrderEvent::payment_intent_expired(intent_id)])
    }

    /// Decides what a provider confirmation does to this order.
    ///
    /// Replays of the settling transaction produce no events. Money that
    /// cannot be applied (wrong amount, second transaction, cancelled
    /// order) produces a reconciliation flag instead of a transition.
    pub fn confirm_payment(
        &self,
        cmd: &ConfirmPayment,
        policy: &AmountPolicy,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        let method = self.placed_method()?;
        let transaction_id = cmd.transaction_id.trim();
        if transaction_id.is_empty() {
            return Err(OrderError::MissingTransactionId);
        }

        let already_settling = self.transaction_id.as_deref() == Some(transaction_id);

        if self.status == OrderStatus::Cancelled {
            if already_settling {
                return Ok(vec![]);
            }
            return Ok(vec![OrderEvent::reconciliation_flagged(
                FlagKind::PaymentAfterCancellation,
                transaction_id,
                self.total,
                cmd.amount,
            )]);
        }

        if self.payment_status.is_settled() {
            if already_settling {
                return Ok(vec![]);
            }
            return Ok(vec![OrderEvent::reconciliation_flagged(
                FlagKind::DuplicatePayment,
                transaction_id,
                self.total,
                cmd.amount,
            )]);
        }

        if !policy.matches(self.total, cmd.amount)? {
            return Ok(vec![OrderEvent::reconciliation_flagged(
                FlagKind::AmountMismatch,
                transaction_id,
                self.total,
                cmd.amount,
            )]);
        }

        if method.is_prepaid() && !self.status.awaits_payment() {
            return Err(self.invalid("confirm payment"));
        }
        if let Some(intent_id) = cmd.intent_id
            && self.intent(intent_id).is_none()
        {
            return Err(OrderError::UnknownIntent(intent_id));
        }

        Ok(vec![OrderEvent::PaymentConfirmed(PaymentConfirmedData {
            intent_id: cmd.intent_id,
            transaction_id: transaction_id.to_string(),
            amount: cmd.amount,
            source: cmd.source,
            confirmed_at: Utc::now(),
        })])
    }

    pub fn fail_payment(&self, cmd: &FailPayment) -> Result<Vec<OrderEvent>, OrderError> {
        let method = self.placed_method()?;
        if self.payment_status.is_settled() {
            return Err(OrderError::AlreadyPaid);
        }
        if !method.is_prepaid() {
            return Err(self.invalid("fail payment"));
        }
        if let Some(intent_id) = cmd.intent_id {
            let intent = self
                .intent(intent_id)
                .ok_or(OrderError::UnknownIntent(intent_id))?;
            // A decline for an attempt that was already superseded.
            if !intent.status.is_live() {
                return Ok(vec![]);
            }
        }

        match self.status {
            OrderStatus::PaymentFailed => Ok(vec![]),
            OrderStatus::PendingPayment => Ok(vec![OrderEvent::payment_failed(
                cmd.intent_id,
                cmd.reason.clone(),
            )]),
            _ => Err(self.invalid("fail payment")),
        }
    }

    pub fn record_cart_cleared(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        if self.cart_cleared {
            return Ok(vec![]);
        }
        Ok(vec![OrderEvent::cart_cleared()])
    }

    pub fn record_stock_committed(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        if self.stock_committed {
            return Ok(vec![]);
        }
        Ok(vec![OrderEvent::stock_committed()])
    }

    /// Attaches the carrier shipment. An order has at most one.
    pub fn record_shipment(&self, cmd: &RecordShipment) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        if let Some(existing) = &self.dispatch {
            if existing.shipment_code == cmd.dispatch.shipment_code {
                return Ok(vec![]);
            }
            return Err(OrderError::ShipmentExists {
                shipment_code: existing.shipment_code.clone(),
            });
        }
        self.ensure_shippable("create shipment")?;

        Ok(vec![OrderEvent::ShipmentCreated(cmd.dispatch.clone())])
    }

    /// Attaches a shipment the carrier created after the order was
    /// cancelled. A shipment the carrier did not void is flagged.
    pub fn record_shipment_after_cancel(
        &self,
        cmd: &RecordShipment,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        if self.status != OrderStatus::Cancelled {
            return Err(self.invalid("record shipment after cancellation"));
        }
        if let Some(existing) = &self.dispatch {
            if existing.shipment_code == cmd.dispatch.shipment_code {
                return Ok(vec![]);
            }
            return Err(OrderError::ShipmentExists {
                shipment_code: existing.shipment_code.clone(),
            });
        }

        let mut events = vec![OrderEvent::ShipmentCreated(cmd.dispatch.clone())];
        if cmd.dispatch.carrier_status != CarrierStatus::Cancelled {
            events.push(OrderEvent::reconciliation_flagged(
                FlagKind::ShipmentAfterCancellation,
                cmd.dispatch.shipment_code.clone(),
                self.total,
                cmd.dispatch.cod_amount,
            ));
        }
        Ok(events)
    }

    /// Records that the carrier could not be reached after retries.
    pub fn record_shipment_failure(
        &self,
        reason: &str,
        attempts: u32,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        if self.dispatch.is_some() {
            return Ok(vec![]);
        }
        self.ensure_shippable("create shipment")?;

        Ok(vec![OrderEvent::shipment_creation_failed(reason, attempts)])
    }

    pub fn update_carrier_status(
        &self,
        status: CarrierStatus,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        let dispatch = self.dispatch.as_ref().ok_or(OrderError::NoShipment)?;
        if dispatch.carrier_status == status {
            return Ok(vec![]);
        }
        let mut events = vec![OrderEvent::carrier_status_updated(status)];
        if status == CarrierStatus::Delivered && !self.status.is_terminal() {
            events.push(OrderEvent::order_completed());
        }
        Ok(events)
    }

    /// Admin status change, guarded against skipping payment and against
    /// unwinding an order that already shipped.
    pub fn override_status(&self, cmd: &OverrideStatus) -> Result<Vec<OrderEvent>, OrderError> {
        let method = self.placed_method()?;
        let from = self.status;
        let to = cmd.to;
        let reject = |reason: &'static str| -> Result<Vec<OrderEvent>, OrderError> {
            Err(OrderError::InvalidOverride { from, to, reason })
        };

        if from == to {
            return Ok(vec![]);
        }
        if from.is_terminal() {
            return reject("order is in a terminal state");
        }

        match to {
            OrderStatus::Cancelled => return reject("use order cancellation"),
            OrderStatus::PaymentFailed => {
                if from != OrderStatus::PendingPayment
                    || !method.is_prepaid()
                    || self.payment_status.is_settled()
                {
                    return reject("only an unpaid prepaid order awaiting payment can fail");
                }
            }
            OrderStatus::PendingPayment => {
                if from != OrderStatus::PaymentFailed {
                    return reject("only a failed payment can be reopened");
                }
            }
            _ => {
                if to == OrderStatus::PaymentConfirmed && !method.is_prepaid() {
                    return reject("cash-on-delivery orders have no payment confirmation step");
                }
                let (Some(from_rank), Some(to_rank)) = (from.rank(), to.rank()) else {
                    return reject("status is off the fulfilment chain");
                };

                if to_rank > from_rank {
                    if method.is_prepaid() && self.payment_status != PaymentStatus::Paid {
                        return reject("payment has not been confirmed");
                    }
                    if matches!(to, OrderStatus::Shipping | OrderStatus::Completed)
                        && self.dispatch.is_none()
                    {
                        return reject("order has no shipment");
                    }
                } else if method.is_prepaid() && self.is_picked_up() {
                    return reject("prepaid order already shipped");
                }
            }
        }

        let mut events = vec![OrderEvent::StatusOverridden(StatusOverriddenData {
            from,
            to,
            actor: cmd.actor.clone(),
            reason: cmd.reason.clone(),
            overridden_at: Utc::now(),
        })];
        if to == OrderStatus::Completed {
            events.push(OrderEvent::order_completed());
        }
        Ok(events)
    }

    /// Cancels the order unless the parcel is already with the carrier.
    pub fn cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, OrderError> {
        self.placed_method()?;
        match self.status {
            OrderStatus::Cancelled => return Ok(vec![]),
            OrderStatus::Completed => return Err(self.invalid("cancel")),
            _ => {}
        }
        if self.is_picked_up() {
            return Err(OrderError::ShipmentAlreadyPickedUp);
        }
        if let Some(dispatch) = &self.dispatch
            && dispatch.carrier_status != CarrierStatus::Cancelled
            && !cmd.shipment_cancelled
        {
            return Err(OrderError::ShipmentNotCancelled {
                shipment_code: dispatch.shipment_code.clone(),
            });
        }

        Ok(vec![OrderEvent::OrderCancelled(OrderCancelledData {
            actor: cmd.actor.clone(),
            reason: cmd.reason.clone(),
            refund_required: self.payment_status == PaymentStatus::Paid,
            shipment_cancelled: cmd.shipment_cancelled && self.dispatch.is_some(),
            cancelled_at: Utc::now(),
        })])
    }
}

// Guards
impl Order {
    fn placed_method(&self) -> Result<PaymentMethod, OrderError> {
        match (self.id, self.payment_method) {
            (Some(_), Some(method)) => Ok(method),
            _ => Err(OrderError::NotFound),
        }
    }

    fn invalid(&self, action: &'static str) -> OrderError {
        OrderError::InvalidStateTransition {
            from: self.status,
            action,
        }
    }

    fn ensure_shippable(&self, action: &'static str) -> Result<(), OrderError> {
        if self.status.is_terminal() {
            return Err(self.invalid(action));
        }
        if self.is_prepaid() && self.payment_status != PaymentStatus::Paid {
            return Err(OrderError::PaymentRequired);
        }
        Ok(())
    }
}

// Apply event helpers
impl Order {
    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }

    fn apply_placed(&mut self, data: OrderPlacedData) {
        self.id = Some(data.order_id);
        self.user_id = Some(data.user_id);
        self.items = data.items;
        self.total = data.total;
        self.payment_method = Some(data.payment_method);
        self.shipping_address = Some(data.shipping_address);
        self.payment_status = PaymentStatus::Pending;
        self.status = if data.payment_method.is_prepaid() {
            OrderStatus::PendingPayment
        } else {
            OrderStatus::Processing
        };
        self.created_at = Some(data.placed_at);
        self.touch(data.placed_at);
    }

    fn apply_intent_created(&mut self, data: PaymentIntentCreatedData) {
        if self.status == OrderStatus::PaymentFailed {
            self.status = OrderStatus::PendingPayment;
            self.payment_status = PaymentStatus::Pending;
        }
        self.intents.push(PaymentIntent {
            intent_id: data.intent_id,
            provider: data.provider,
            provider_reference: data.provider_reference,
            amount: data.amount,
            status: IntentStatus::Created,
            idempotency_key: data.idempotency_key,
            approval_url: data.approval_url,
            created_at: data.created_at,
            updated_at: data.created_at,
        });
        self.touch(data.created_at);
    }

    fn apply_confirmed(&mut self, data: PaymentConfirmedData) {
        self.payment_status = PaymentStatus::Paid;
        self.transaction_id = Some(data.transaction_id);
        self.paid_at = Some(data.confirmed_at);
        if self.is_prepaid() {
            self.status = OrderStatus::PaymentConfirmed;
        }

        let confirmed = data
            .intent_id
            .and_then(|id| self.intents.iter().position(|i| i.intent_id == id))
            .or_else(|| self.intents.iter().rposition(|i| i.status.is_live()))
            .or_else(|| self.intents.len().checked_sub(1));

        for (index, intent) in self.intents.iter_mut().enumerate() {
            if Some(index) == confirmed {
                intent.status = IntentStatus::Confirmed;
                intent.updated_at = data.confirmed_at;
            } else if intent.status.is_live() {
                intent.status = IntentStatus::Expired;
                intent.updated_at = data.confirmed_at;
            }
        }
        self.touch(data.confirmed_at);
    }

    fn apply_cancelled(&mut self, data: OrderCancelledData) {
        self.status = OrderStatus::Cancelled;
        if data.refund_required {
            self.payment_status = PaymentStatus::RefundPending;
            self.refund_required = true;
        }
        self.settle_live_intents(IntentStatus::Expired, data.cancelled_at);
        if data.shipment_cancelled
            && let Some(dispatch) = self.dispatch.as_mut()
        {
            dispatch.carrier_status = CarrierStatus::Cancelled;
        }
        self.shipment_pending = false;
        self.cancellation_reason = data.reason;
        self.touch(data.cancelled_at);
    }

    fn set_intent_status(&mut self, intent_id: Uuid, status: IntentStatus, at: DateTime<Utc>) {
        if let Some(intent) = self.intents.iter_mut().find(|i| i.intent_id == intent_id) {
            intent.status = status;
            intent.updated_at = at;
        }
    }

    fn settle_live_intents(&mut self, status: IntentStatus, at: DateTime<Utc>) {
        for intent in self.intents.iter_mut().filter(|i| i.status.is_live()) {
            intent.status = status;
            intent.updated_at = at;
        }
    }
}
