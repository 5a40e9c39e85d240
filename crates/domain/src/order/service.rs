//! Order service providing a simplified API for order operations.

use common::AggregateId;
use event_store::EventStore;
use uuid::Uuid;

use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;
use crate::money::{AmountPolicy, Money};

use super::{
    CancelOrder, CarrierStatus, ConfirmPayment, FailPayment, FlagKind, Order, OrderEvent,
    OverrideStatus, PlaceOrder, RecordIntent, RecordShipment,
};

/// Default bound on re-running a command after losing an append race.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What a payment confirmation did to the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// This call moved the order to PAID.
    Confirmed,
    /// The same transaction had already settled the order.
    AlreadyApplied,
    /// A second transaction for a paid order was flagged for operators.
    DuplicateFlagged,
    /// The amount was outside tolerance; the order did not move.
    AmountMismatch { expected: Money, received: Money },
    /// Money arrived for a cancelled order; flagged, not applied.
    AfterCancellation,
}

impl ConfirmOutcome {
    fn from_events(events: &[OrderEvent]) -> Self {
        for event in events {
            match event {
                OrderEvent::PaymentConfirmed(_) => return ConfirmOutcome::Confirmed,
                OrderEvent::ReconciliationFlagged(flag) => match flag.kind {
                    FlagKind::DuplicatePayment => return ConfirmOutcome::DuplicateFlagged,
                    FlagKind::AmountMismatch => {
                        return ConfirmOutcome::AmountMismatch {
                            expected: flag.expected,
                            received: flag.received,
                        };
                    }
                    FlagKind::PaymentAfterCancellation => return ConfirmOutcome::AfterCancellation,
                    FlagKind::ShipmentAfterCancellation => {}
                },
                _ => {}
            }
        }
        ConfirmOutcome::AlreadyApplied
    }

    /// The order is paid by the transaction that was confirmed.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ConfirmOutcome::Confirmed
                | ConfirmOutcome::AlreadyApplied
                | ConfirmOutcome::DuplicateFlagged
        )
    }
}

/// Result of [`OrderService::confirm_payment`].
#[derive(Debug)]
pub struct PaymentApplied {
    pub result: CommandResult<Order>,
    pub outcome: ConfirmOutcome,
}

impl PaymentApplied {
    pub fn order(&self) -> &Order {
        &self.result.aggregate
    }

    /// Only the caller whose append produced the confirmation sees true.
    pub fn won(&self) -> bool {
        self.outcome == ConfirmOutcome::Confirmed
    }
}

/// Service for managing orders.
///
/// Wraps the command handler and the amount policy. Every write goes
/// through [`CommandHandler::execute_with_retry`], so a caller that lost an
/// append race re-decides against the winner's state.
pub struct OrderService<S: EventStore> {
    handler: CommandHandler<S, Order>,
    policy: AmountPolicy,
    max_attempts: u32,
}

impl<S: EventStore> OrderService<S> {
    /// Creates a new order service with the given event store.
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
            policy: AmountPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_policy(mut self, policy: AmountPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Returns a reference to the underlying command handler.
    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    pub fn policy(&self) -> &AmountPolicy {
        &self.policy
    }

    /// Loads an order by ID.
    ///
    /// Returns None if the order doesn't exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>, DomainError> {
        self.handler.load_existing(order_id).await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, method = %cmd.payment_method))]
    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<CommandResult<Order>, DomainError> {
        let result = self
            .handler
            .execute(cmd.order_id, |order| order.place(&cmd))
            .await?;

        metrics::counter!("orders_placed_total", "method" => cmd.payment_method.as_str())
            .increment(1);
        tracing::info!(total = %result.aggregate.total(), "Order placed");
        Ok(result)
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, intent_id = %cmd.intent_id))]
    pub async fn record_intent(
        &self,
        cmd: RecordIntent,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(cmd.order_id, |order| order.record_intent(&cmd))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_outcome_unknown(
        &self,
        order_id: AggregateId,
        intent_id: Uuid,
        reason: &str,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(order_id, |order| order.mark_outcome_unknown(intent_id, reason))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn expire_intent(
        &self,
        order_id: AggregateId,
        intent_id: Uuid,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(order_id, |order| order.expire_intent(intent_id))
            .await
    }

    /// Applies a provider confirmation and reports what it did.
    #[tracing::instrument(
        skip(self, cmd),
        fields(order_id = %cmd.order_id, transaction_id = %cmd.transaction_id, source = ?cmd.source)
    )]
    pub async fn confirm_payment(&self, cmd: ConfirmPayment) -> Result<PaymentApplied, DomainError> {
        let policy = &self.policy;
        let result = self
            .retrying(cmd.order_id, |order| order.confirm_payment(&cmd, policy))
            .await?;
        let outcome = ConfirmOutcome::from_events(&result.events);

        match outcome {
            ConfirmOutcome::Confirmed => {
                metrics::counter!("payments_confirmed_total").increment(1);
                tracing::info!(amount = %cmd.amount, "Payment confirmed");
            }
            ConfirmOutcome::AlreadyApplied => {
                tracing::debug!("Payment already applied");
            }
            ConfirmOutcome::DuplicateFlagged => {
                tracing::warn!(
                    settled_by = result.aggregate.transaction_id(),
                    "Second payment for a paid order flagged"
                );
            }
            ConfirmOutcome::AmountMismatch { expected, received } => {
                metrics::counter!("payment_amount_mismatch_total").increment(1);
                tracing::warn!(%expected, %received, "Payment amount mismatch flagged");
            }
            ConfirmOutcome::AfterCancellation => {
                tracing::warn!(amount = %cmd.amount, "Payment for a cancelled order flagged");
            }
        }

        Ok(PaymentApplied { result, outcome })
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn fail_payment(&self, cmd: FailPayment) -> Result<CommandResult<Order>, DomainError> {
        let result = self
            .retrying(cmd.order_id, |order| order.fail_payment(&cmd))
            .await?;
        if result.changed() {
            metrics::counter!("payments_failed_total").increment(1);
            tracing::info!(reason = %cmd.reason, "Payment failed");
        }
        Ok(result)
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_cart_cleared(
        &self,
        order_id: AggregateId,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(order_id, |order| order.record_cart_cleared())
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_stock_committed(
        &self,
        order_id: AggregateId,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(order_id, |order| order.record_stock_committed())
            .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, shipment_code = %cmd.dispatch.shipment_code))]
    pub async fn record_shipment(
        &self,
        cmd: RecordShipment,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(cmd.order_id, |order| order.record_shipment(&cmd))
            .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, shipment_code = %cmd.dispatch.shipment_code))]
    pub async fn record_shipment_after_cancel(
        &self,
        cmd: RecordShipment,
    ) -> Result<CommandResult<Order>, DomainError> {
        let result = self
            .retrying(cmd.order_id, |order| order.record_shipment_after_cancel(&cmd))
            .await?;
        if result.events.iter().any(|e| e.is_flag(FlagKind::ShipmentAfterCancellation)) {
            tracing::error!("Live shipment on a cancelled order flagged");
        }
        Ok(result)
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_shipment_failure(
        &self,
        order_id: AggregateId,
        reason: &str,
        attempts: u32,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(order_id, |order| {
            order.record_shipment_failure(reason, attempts)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_carrier_status(
        &self,
        order_id: AggregateId,
        status: CarrierStatus,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(order_id, |order| order.update_carrier_status(status))
            .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, to = %cmd.to, actor = %cmd.actor))]
    pub async fn override_status(
        &self,
        cmd: OverrideStatus,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(cmd.order_id, |order| order.override_status(&cmd))
            .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, actor = %cmd.actor))]
    pub async fn cancel_order(&self, cmd: CancelOrder) -> Result<CommandResult<Order>, DomainError> {
        self.retrying(cmd.order_id, |order| order.cancel(&cmd))
            .await
    }

    /// Orders not yet cancelled or completed.
    pub async fn find_open_orders(&self) -> Result<Vec<AggregateId>, DomainError> {
        Ok(self
            .handler
            .store()
            .find_aggregate_ids("Order", &["OrderPlaced"], &["OrderCancelled", "OrderCompleted"])
            .await?)
    }

    async fn retrying<F>(
        &self,
        order_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<Order>, DomainError>
    where
        F: Fn(&Order) -> Result<Vec<OrderEvent>, super::OrderError>,
    {
        self.handler
            .execute_with_retry(order_id, self.max_attempts, command_fn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::money::Currency;
    use crate::order::{
        ConfirmationSource, LineItem, OrderError, OrderStatus, PaymentStatus, ShippingAddress,
        UserId,
    };
    use common::PaymentMethod;
    use event_store::InMemoryEventStore;

    fn vnd(amount: i64) -> Money {
        Money::new(amount, Currency::Vnd)
    }

    fn place_cmd(method: PaymentMethod) -> PlaceOrder {
        PlaceOrder::new(
            UserId::new(),
            vec![
                LineItem::new("SKU-TEE", "T-shirt", 2, vnd(75_000)),
                LineItem::new("SKU-CAP", "Cap", 1, vnd(20_500)),
            ],
            ShippingAddress {
                recipient_name: "Pham D".into(),
                phone: "0933333333".into(),
                street: "9 Hai Ba Trung".into(),
                ward: "Ward 6".into(),
                district: "District 3".into(),
                province: "Ho Chi Minh".into(),
                note: None,
            },
            method,
        )
    }

    async fn placed(service: &OrderService<InMemoryEventStore>) -> AggregateId {
        let cmd = place_cmd(PaymentMethod::SignedCallback);
        let order_id = cmd.order_id;
        service.place_order(cmd).await.unwrap();
        order_id
    }

    fn confirmation(order_id: AggregateId, txn: &str, amount: i64) -> ConfirmPayment {
        ConfirmPayment::new(order_id, txn, vnd(amount), ConfirmationSource::Webhook)
    }

    #[tokio::test]
    async fn test_place_and_get_order() {
        let service = OrderService::new(InMemoryEventStore::new());
        assert!(service.get_order(AggregateId::new()).await.unwrap().is_none());

        let order_id = placed(&service).await;
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.id(), Some(order_id));
        assert_eq!(order.total(), vnd(170_500));
        assert_eq!(order.status(), OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_confirm_outcomes() {
        let service = OrderService::new(InMemoryEventStore::new());
        let order_id = placed(&service).await;

        let first = service
            .confirm_payment(confirmation(order_id, "T-1", 170_500))
            .await
            .unwrap();
        assert_eq!(first.outcome, ConfirmOutcome::Confirmed);
        assert!(first.won());
        assert_eq!(first.order().payment_status(), PaymentStatus::Paid);

        let replay = service
            .confirm_payment(confirmation(order_id, "T-1", 170_500))
            .await
            .unwrap();
        assert_eq!(replay.outcome, ConfirmOutcome::AlreadyApplied);
        assert!(!replay.won());
        assert!(replay.outcome.is_success());

        let second = service
            .confirm_payment(confirmation(order_id, "T-2", 170_500))
            .await
            .unwrap();
        assert_eq!(second.outcome, ConfirmOutcome::DuplicateFlagged);
        assert_eq!(second.order().flags().len(), 1);
    }

    #[tokio::test]
    async fn test_amount_mismatch_outcome() {
        let service = OrderService::new(InMemoryEventStore::new());
        let order_id = placed(&service).await;

        let applied = service
            .confirm_payment(confirmation(order_id, "T-1", 100_000))
            .await
            .unwrap();
        assert_eq!(
            applied.outcome,
            ConfirmOutcome::AmountMismatch {
                expected: vnd(170_500),
                received: vnd(100_000)
            }
        );
        assert!(!applied.outcome.is_success());
        assert_eq!(applied.order().status(), OrderStatus::PendingPayment);
        assert_eq!(applied.order().flags().len(), 1);
    }

    #[tokio::test]
    async fn test_rejections_surface_as_order_errors() {
        let service = OrderService::new(InMemoryEventStore::new());
        let order_id = placed(&service).await;

        let err = service
            .update_carrier_status(order_id, CarrierStatus::PickedUp)
            .await
            .unwrap_err();
        assert_eq!(err.as_order_error(), Some(&OrderError::NoShipment));
    }

    #[tokio::test]
    async fn test_find_open_orders() {
        let service = OrderService::new(InMemoryEventStore::new());
        let paid = placed(&service).await;
        let untouched = placed(&service).await;
        let cancelled = placed(&service).await;
        service
            .confirm_payment(confirmation(paid, "T-1", 170_500))
            .await
            .unwrap();
        service
            .cancel_order(CancelOrder::new(cancelled, "admin-1", None))
            .await
            .unwrap();

        let mut open = service.find_open_orders().await.unwrap();
        open.sort();
        let mut expected = vec![paid, untouched];
        expected.sort();
        assert_eq!(open, expected);
    }

    #[tokio::test]
    async fn test_cancel_and_record_side_effects() {
        let service = OrderService::new(InMemoryEventStore::new());
        let cmd = place_cmd(PaymentMethod::Cod);
        let order_id = cmd.order_id;
        service.place_order(cmd).await.unwrap();

        assert!(service.record_cart_cleared(order_id).await.unwrap().changed());
        assert!(!service.record_cart_cleared(order_id).await.unwrap().changed());
        assert!(service.record_stock_committed(order_id).await.unwrap().changed());

        let cancelled = service
            .cancel_order(CancelOrder::new(order_id, "admin-1", Some("no stock".into())))
            .await
            .unwrap();
        assert_eq!(cancelled.aggregate.status(), OrderStatus::Cancelled);
        assert_eq!(cancelled.new_version.as_i64(), 4);
    }
}
