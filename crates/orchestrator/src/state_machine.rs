//! The order state machine.
//!
//! Every transition is a conditional append on the order's event stream
//! (see [`domain::CommandHandler`]). Side effects of a confirmed payment
//! (cart clear, stock commit, carrier shipment) run only for the caller
//! whose append produced the confirmation, and each one is recorded as an
//! event so a re-run skips what already happened. No lock is held across
//! a provider or carrier call: the store's version check is the lock.

use std::sync::Arc;

use common::AggregateId;
use domain::{
    Aggregate, CancelOrder, CarrierStatus, ConfirmOutcome, ConfirmPayment, ConfirmationSource,
    DomainError, FailPayment, FlagKind, Money, Order, OrderError, OrderService, OrderStatus,
    OverrideStatus, PaymentStatus, RecordShipment, ShippingDispatch,
};
use event_store::EventStore;
use gateways::{ProviderStatus, ShippingDispatchAdapter, ShippingError};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::storefront::Storefront;

/// Cancel re-runs when a shipment shows up between its read and its write.
const CANCEL_ATTEMPTS: u32 = 3;

/// An event applied to an order from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    PaymentConfirmed {
        transaction_id: String,
        amount: Money,
        intent_id: Option<Uuid>,
        source: ConfirmationSource,
    },
    PaymentFailed {
        reason: String,
        intent_id: Option<Uuid>,
    },
    ManualStatusOverride {
        to: OrderStatus,
        actor: String,
        reason: Option<String>,
    },
    CancelRequested {
        actor: String,
        reason: Option<String>,
    },
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::PaymentConfirmed { .. } => "payment_confirmed",
            Transition::PaymentFailed { .. } => "payment_failed",
            Transition::ManualStatusOverride { .. } => "manual_status_override",
            Transition::CancelRequested { .. } => "cancel_requested",
        }
    }
}

/// Result of [`OrderStateMachine::apply`].
#[derive(Debug, Clone)]
pub struct Applied {
    /// The order as durably recorded after the transition.
    pub order: Order,
    /// This call wrote at least one event.
    pub changed: bool,
    /// Set for payment confirmations.
    pub confirmation: Option<ConfirmOutcome>,
}

/// Owns the order lifecycle and its side effects.
pub struct OrderStateMachine<S: EventStore> {
    orders: Arc<OrderService<S>>,
    shipping: ShippingDispatchAdapter,
    storefront: Arc<dyn Storefront>,
}

impl<S: EventStore> OrderStateMachine<S> {
    pub fn new(
        orders: Arc<OrderService<S>>,
        shipping: ShippingDispatchAdapter,
        storefront: Arc<dyn Storefront>,
    ) -> Self {
        Self {
            orders,
            shipping,
            storefront,
        }
    }

    pub fn orders(&self) -> &OrderService<S> {
        &self.orders
    }

    pub fn shipping(&self) -> &ShippingDispatchAdapter {
        &self.shipping
    }

    /// Loads the durably recorded order.
    pub async fn load(&self, order_id: AggregateId) -> Result<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or(OrchestratorError::OrderNotFound(order_id))
    }

    /// Applies an external event to an order.
    ///
    /// A replayed confirmation of the transaction that already settled the
    /// order succeeds with `changed == false` and fires nothing. An amount
    /// outside tolerance is flagged on the order and returned as
    /// [`OrchestratorError::AmountMismatch`].
    #[tracing::instrument(skip(self, transition), fields(transition = transition.name()))]
    pub async fn apply(&self, order_id: AggregateId, transition: Transition) -> Result<Applied> {
        match transition {
            Transition::PaymentConfirmed {
                transaction_id,
                amount,
                intent_id,
                source,
            } => {
                let mut cmd = ConfirmPayment::new(order_id, transaction_id, amount, source);
                cmd.intent_id = intent_id;
                self.confirm(cmd).await
            }
            Transition::PaymentFailed { reason, intent_id } => {
                let mut cmd = FailPayment::new(order_id, reason);
                cmd.intent_id = intent_id;
                let result = self
                    .orders
                    .fail_payment(cmd)
                    .await
                    .map_err(not_found(order_id))?;
                Ok(Applied {
                    changed: result.changed(),
                    order: result.aggregate,
                    confirmation: None,
                })
            }
            Transition::ManualStatusOverride { to, actor, reason } => {
                let result = self
                    .orders
                    .override_status(OverrideStatus {
                        order_id,
                        to,
                        actor,
                        reason,
                    })
                    .await
                    .map_err(not_found(order_id))?;
                if result.changed() {
                    metrics::counter!("status_overrides_total", "to" => to.as_str()).increment(1);
                }
                Ok(Applied {
                    changed: result.changed(),
                    order: result.aggregate,
                    confirmation: None,
                })
            }
            Transition::CancelRequested { actor, reason } => {
                self.cancel(order_id, actor, reason).await
            }
        }
    }

    /// Feeds a provider-reported status through [`apply`](Self::apply).
    /// `None` when the provider has no definitive answer yet.
    pub async fn apply_provider_status(
        &self,
        order_id: AggregateId,
        intent_id: Option<Uuid>,
        status: ProviderStatus,
        source: ConfirmationSource,
    ) -> Result<Option<Applied>> {
        let transition = match status {
            ProviderStatus::Pending => return Ok(None),
            ProviderStatus::Paid {
                transaction_id,
                amount,
            } => Transition::PaymentConfirmed {
                transaction_id,
                amount,
                intent_id,
                source,
            },
            ProviderStatus::Failed { reason } => Transition::PaymentFailed { reason, intent_id },
        };
        self.apply(order_id, transition).await.map(Some)
    }

    async fn confirm(&self, cmd: ConfirmPayment) -> Result<Applied> {
        let order_id = cmd.order_id;
        let applied = self
            .orders
            .confirm_payment(cmd)
            .await
            .map_err(not_found(order_id))?;
        let changed = applied.result.changed();

        match applied.outcome {
            ConfirmOutcome::AmountMismatch { expected, received } => {
                Err(OrchestratorError::AmountMismatch { expected, received })
            }
            ConfirmOutcome::AfterCancellation => {
                Err(OrchestratorError::PaymentAfterCancellation(order_id))
            }
            ConfirmOutcome::Confirmed => {
                let order = self.settle_winner(applied.result.aggregate).await;
                Ok(Applied {
                    order,
                    changed,
                    confirmation: Some(ConfirmOutcome::Confirmed),
                })
            }
            outcome => Ok(Applied {
                order: applied.result.aggregate,
                changed,
                confirmation: Some(outcome),
            }),
        }
    }

    /// Runs settlement for the caller that won the confirmation. The
    /// payment is already durable, so a settlement error only leaves work
    /// for the reconciliation sweep.
    async fn settle_winner(&self, order: Order) -> Order {
        let fallback = order.clone();
        match self.run_settlement(order, false).await {
            Ok(order) => order,
            Err(err) => {
                tracing::error!(
                    order_id = ?fallback.id(),
                    error = %err,
                    "settlement interrupted after payment; reconciliation will resume it"
                );
                fallback
            }
        }
    }

    /// Finishes whatever settlement steps are missing. Safe to call any
    /// number of times; COD orders settle right after placement.
    #[tracing::instrument(skip(self))]
    pub async fn settle(&self, order_id: AggregateId) -> Result<Order> {
        let order = self.load(order_id).await?;
        self.run_settlement(order, false).await
    }

    /// Like [`settle`](Self::settle), but asks the carrier for an existing
    /// shipment before creating one.
    pub(crate) async fn resume_settlement(&self, order_id: AggregateId) -> Result<Order> {
        let order = self.load(order_id).await?;
        self.run_settlement(order, true).await
    }

    async fn run_settlement(&self, mut order: Order, recover: bool) -> Result<Order> {
        let (Some(order_id), Some(user_id)) = (order.id(), order.user_id()) else {
            return Ok(order);
        };
        if !order.is_shippable() {
            return Ok(order);
        }

        if !order.cart_cleared() {
            match self.storefront.clear_cart(user_id, order_id).await {
                Ok(()) => order = self.orders.record_cart_cleared(order_id).await?.aggregate,
                Err(err) => tracing::warn!(%order_id, error = %err, "cart clear failed"),
            }
        }
        if !order.stock_committed() {
            match self.storefront.commit_stock(order_id, order.items()).await {
                Ok(()) => order = self.orders.record_stock_committed(order_id).await?.aggregate,
                Err(err) => tracing::warn!(%order_id, error = %err, "stock commit failed"),
            }
        }
        if order.dispatch().is_none() && !order.is_terminal() {
            order = self.dispatch_shipment(order, recover).await?;
        }
        Ok(order)
    }

    async fn dispatch_shipment(&self, order: Order, recover: bool) -> Result<Order> {
        let Some(order_id) = order.id() else {
            return Ok(order);
        };

        let created = if recover || order.shipment_failures() > 0 {
            self.shipping.recover(&order).await
        } else {
            self.shipping.create(&order).await
        };

        match created {
            Ok(dispatch) => {
                let cod = !dispatch.cod_amount.is_zero();
                let recorded = match self
                    .orders
                    .record_shipment(RecordShipment {
                        order_id,
                        dispatch: dispatch.clone(),
                    })
                    .await
                {
                    Ok(recorded) => recorded,
                    Err(err) => {
                        let current = self.load(order_id).await?;
                        if current.status() != OrderStatus::Cancelled {
                            return Err(err.into());
                        }
                        return self.void_late_shipment(order_id, dispatch).await;
                    }
                };
                if recorded.changed() {
                    metrics::counter!("shipments_created_total", "cod" => if cod { "true" } else { "false" })
                        .increment(1);
                }
                Ok(recorded.aggregate)
            }
            Err(err) => {
                let attempts = if err.is_transient() {
                    self.shipping.policy().max_attempts
                } else {
                    1
                };
                metrics::counter!("shipment_failures_total").increment(1);
                tracing::error!(
                    %order_id,
                    error = %err,
                    attempts,
                    payment_status = %order.payment_status(),
                    "shipment creation failed; order flagged shipment-pending"
                );
                Ok(self
                    .orders
                    .record_shipment_failure(order_id, &err.to_string(), attempts)
                    .await?
                    .aggregate)
            }
        }
    }

    /// The order was cancelled while the carrier was creating its shipment.
    /// Cancels the parcel at the carrier and records it; a parcel the
    /// carrier keeps is flagged for operators.
    async fn void_late_shipment(
        &self,
        order_id: AggregateId,
        mut dispatch: ShippingDispatch,
    ) -> Result<Order> {
        let shipment_code = dispatch.shipment_code.clone();
        tracing::warn!(%order_id, %shipment_code, "order cancelled during shipment creation; cancelling at carrier");

        match self.shipping.cancel(&shipment_code).await {
            Ok(_) => dispatch.carrier_status = CarrierStatus::Cancelled,
            Err(err) => {
                tracing::error!(%order_id, %shipment_code, error = %err, "carrier kept shipment of a cancelled order");
            }
        }

        let recorded = self
            .orders
            .record_shipment_after_cancel(RecordShipment { order_id, dispatch })
            .await
            .map_err(not_found(order_id))?;
        if recorded
            .aggregate
            .has_flag(FlagKind::ShipmentAfterCancellation, &shipment_code)
        {
            metrics::counter!("shipments_after_cancellation_total").increment(1);
        }
        Ok(recorded.aggregate)
    }

    /// Operator retry for an order whose shipment could not be created.
    #[tracing::instrument(skip(self))]
    pub async fn retry_shipment(&self, order_id: AggregateId) -> Result<Order> {
        let order = self.load(order_id).await?;
        if let Some(dispatch) = order.dispatch() {
            return Err(OrchestratorError::Rejected(OrderError::ShipmentExists {
                shipment_code: dispatch.shipment_code.clone(),
            }));
        }
        if order.is_terminal() {
            return Err(OrchestratorError::Rejected(
                OrderError::InvalidStateTransition {
                    from: order.status(),
                    action: "create shipment",
                },
            ));
        }
        if order.is_prepaid() && order.payment_status() != PaymentStatus::Paid {
            return Err(OrchestratorError::Rejected(OrderError::PaymentRequired));
        }
        self.dispatch_shipment(order, true).await
    }

    /// Pulls the carrier's view of the shipment and records it.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_carrier_status(&self, order_id: AggregateId) -> Result<Order> {
        let order = self.load(order_id).await?;
        let shipment_code = order
            .dispatch()
            .map(|d| d.shipment_code.clone())
            .ok_or(OrchestratorError::Rejected(OrderError::NoShipment))?;

        let status = self.shipping.track(&shipment_code).await?;
        Ok(self
            .orders
            .update_carrier_status(order_id, status)
            .await?
            .aggregate)
    }

    /// Cancels an order, dropping the carrier shipment first.
    ///
    /// Refused once the parcel has been picked up, whether the order
    /// already knows it or the carrier says so.
    async fn cancel(
        &self,
        order_id: AggregateId,
        actor: String,
        reason: Option<String>,
    ) -> Result<Applied> {
        let mut attempt = 1;
        loop {
            match self.try_cancel(order_id, actor.clone(), reason.clone()).await {
                Err(OrchestratorError::Rejected(OrderError::ShipmentNotCancelled {
                    shipment_code,
                })) if attempt < CANCEL_ATTEMPTS => {
                    tracing::info!(%order_id, %shipment_code, attempt, "shipment appeared during cancel; retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_cancel(
        &self,
        order_id: AggregateId,
        actor: String,
        reason: Option<String>,
    ) -> Result<Applied> {
        let order = self.load(order_id).await?;
        if order.status() == OrderStatus::Cancelled {
            return Ok(Applied {
                order,
                changed: false,
                confirmation: None,
            });
        }
        if order.is_picked_up() {
            return Err(OrchestratorError::Rejected(
                OrderError::ShipmentAlreadyPickedUp,
            ));
        }

        let mut shipment_cancelled = false;
        if let Some(dispatch) = order.dispatch()
            && dispatch.carrier_status != CarrierStatus::Cancelled
        {
            match self.shipping.cancel(&dispatch.shipment_code).await {
                Ok(known) => {
                    if !known {
                        tracing::warn!(%order_id, shipment_code = %dispatch.shipment_code, "carrier does not know the shipment");
                    }
                    shipment_cancelled = true;
                }
                Err(ShippingError::AlreadyPickedUp(code)) => {
                    tracing::warn!(%order_id, shipment_code = %code, "carrier refused cancel: parcel picked up");
                    return Err(OrchestratorError::Rejected(
                        OrderError::ShipmentAlreadyPickedUp,
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut cmd = CancelOrder::new(order_id, actor, reason);
        cmd.shipment_cancelled = shipment_cancelled;
        let result = self
            .orders
            .cancel_order(cmd)
            .await
            .map_err(not_found(order_id))?;

        if result.changed() {
            metrics::counter!("orders_cancelled_total").increment(1);
            if result.aggregate.refund_required() {
                tracing::warn!(%order_id, "paid order cancelled; refund required");
            }
        }
        Ok(Applied {
            changed: result.changed(),
            order: result.aggregate,
            confirmation: None,
        })
    }

    pub async fn mark_outcome_unknown(
        &self,
        order_id: AggregateId,
        intent_id: Uuid,
        reason: &str,
    ) -> Result<Order> {
        Ok(self
            .orders
            .mark_outcome_unknown(order_id, intent_id, reason)
            .await
            .map_err(not_found(order_id))?
            .aggregate)
    }

    pub async fn expire_intent(&self, order_id: AggregateId, intent_id: Uuid) -> Result<Order> {
        Ok(self
            .orders
            .expire_intent(order_id, intent_id)
            .await
            .map_err(not_found(order_id))?
            .aggregate)
    }
}

fn not_found(order_id: AggregateId) -> impl FnOnce(DomainError) -> OrchestratorError {
    move |err| OrchestratorError::rejected_or_missing(err, order_id)
}
