//! Checkout: order placement, payment intents and synchronous capture.

use std::sync::Arc;

use common::{AggregateId, PaymentMethod};
use domain::{
    ConfirmationSource, Order, OrderError, PaymentIntent, PaymentStatus, PlaceOrder, RecordIntent,
};
use event_store::EventStore;
use gateways::{
    ConfirmationResult, GatewayError, GatewayRegistry, IntentRef, IntentRequest, PaymentGateway,
    ProviderStatus,
};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::state_machine::{OrderStateMachine, Transition};

/// Result of [`CheckoutService::place_order`].
#[derive(Debug, Clone)]
pub struct Checkout {
    pub order: Order,
    /// First payment intent of a prepaid order.
    pub intent: Option<PaymentIntent>,
    /// Set when the order was recorded but the provider could not open a
    /// payment. The caller can open one later.
    pub payment_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenedPayment {
    pub order: Order,
    pub intent: PaymentIntent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStatus {
    /// This call captured the payment and settled the order.
    Captured,
    /// The order was already paid; nothing was captured.
    AlreadyPaid,
    /// The provider's answer is unknown; the reconciliation sweep resolves it.
    Pending,
    Declined(String),
}

#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub order: Order,
    pub status: CaptureStatus,
}

pub struct CheckoutService<S: EventStore> {
    machine: Arc<OrderStateMachine<S>>,
    gateways: GatewayRegistry,
}

impl<S: EventStore> CheckoutService<S> {
    pub fn new(machine: Arc<OrderStateMachine<S>>, gateways: GatewayRegistry) -> Self {
        Self { machine, gateways }
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    /// Records a new order. Cash-on-delivery orders settle right away;
    /// prepaid orders get their first payment intent.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, method = %cmd.payment_method))]
    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<Checkout> {
        let method = cmd.payment_method;
        self.gateways.get(method)?;

        let order_id = cmd.order_id;
        let placed = self
            .machine
            .orders()
            .place_order(cmd)
            .await
            .map_err(OrchestratorError::from)?;

        if !method.is_prepaid() {
            let order = self.machine.settle(order_id).await?;
            return Ok(Checkout {
                order,
                intent: None,
                payment_error: None,
            });
        }

        match self.open_payment(order_id, method).await {
            Ok(opened) => Ok(Checkout {
                order: opened.order,
                intent: Some(opened.intent),
                payment_error: None,
            }),
            Err(err) => {
                tracing::warn!(%order_id, error = %err, "order placed but payment could not be opened");
                Ok(Checkout {
                    order: placed.aggregate,
                    intent: None,
                    payment_error: Some(err.to_string()),
                })
            }
        }
    }

    /// Opens a payment intent with the provider. Returns the live intent if
    /// one is already open.
    #[tracing::instrument(skip(self))]
    pub async fn open_payment(
        &self,
        order_id: AggregateId,
        method: PaymentMethod,
    ) -> Result<OpenedPayment> {
        let gateway = self.gateways.get(method)?;
        let order = self.machine.load(order_id).await?;
        check_can_open(&order, method)?;

        if let Some(live) = order.live_intent() {
            let intent = live.clone();
            return Ok(OpenedPayment { order, intent });
        }

        let currency = gateway
            .settlement_currency()
            .unwrap_or(order.total().currency());
        let amount = self
            .machine
            .orders()
            .policy()
            .convert(order.total(), currency)
            .map_err(|e| OrchestratorError::Rejected(OrderError::Money(e)))?;
        if currency != order.total().currency() {
            tracing::info!(
                total = %order.total(),
                %amount,
                "order total converted with a configured, non-authoritative rate"
            );
        }

        let request = IntentRequest {
            order_id,
            intent_id: Uuid::new_v4(),
            amount,
            idempotency_key: PaymentIntent::idempotency_key_for(
                order_id,
                order.next_intent_attempt(),
            ),
            description: format!("Order {order_id}"),
        };
        let created = gateway.create_intent(&request).await?;

        let recorded = self
            .machine
            .orders()
            .record_intent(RecordIntent {
                order_id,
                intent_id: request.intent_id,
                provider: method,
                provider_reference: created.provider_reference,
                amount: created.amount,
                idempotency_key: request.idempotency_key,
                approval_url: created.approval_url,
            })
            .await;

        let order = match recorded {
            Ok(result) => result.aggregate,
            // A concurrent request opened the same attempt first.
            Err(err) if matches!(err.as_order_error(), Some(OrderError::LiveIntentExists { .. })) => {
                self.machine.load(order_id).await?
            }
            Err(err) => return Err(OrchestratorError::rejected_or_missing(err, order_id)),
        };

        let intent = order
            .live_intent()
            .cloned()
            .ok_or(OrchestratorError::Rejected(OrderError::InvalidStateTransition {
                from: order.status(),
                action: "open payment",
            }))?;
        metrics::counter!("payment_intents_created_total", "provider" => method.as_str())
            .increment(1);
        Ok(OpenedPayment { order, intent })
    }

    /// Captures a redirect-capture payment after the payer approved it.
    ///
    /// A timed-out capture is re-queried before anything is decided, so a
    /// capture that went through at the provider is never attempted twice.
    #[tracing::instrument(skip(self))]
    pub async fn capture(
        &self,
        order_id: AggregateId,
        provider_reference: Option<String>,
    ) -> Result<CaptureResult> {
        let order = self.machine.load(order_id).await?;
        if order.payment_status().is_settled() {
            return Ok(CaptureResult {
                order,
                status: CaptureStatus::AlreadyPaid,
            });
        }
        let method = order
            .payment_method()
            .ok_or(OrchestratorError::OrderNotFound(order_id))?;
        let gateway = self.gateways.get(method)?;

        let intent = match provider_reference.as_deref() {
            Some(reference) => order
                .intent_by_reference(reference)
                .ok_or_else(|| GatewayError::UnknownReference(reference.to_string()))?,
            None => order.live_intent().ok_or(OrchestratorError::Rejected(
                OrderError::InvalidStateTransition {
                    from: order.status(),
                    action: "capture payment",
                },
            ))?,
        };
        if !intent.status.is_live() {
            return Err(OrchestratorError::Rejected(
                OrderError::InvalidStateTransition {
                    from: order.status(),
                    action: "capture payment",
                },
            ));
        }
        let intent_id = intent.intent_id;
        let expected = intent.amount;
        let intent_ref = IntentRef {
            order_id,
            provider_reference: intent.provider_reference.clone(),
        };

        let result = match gateway.confirm(&intent_ref).await {
            Ok(result) => result,
            Err(err) if err.is_unknown_outcome() => {
                tracing::warn!(error = %err, "capture outcome unknown; re-querying provider");
                match self.requery(&gateway, &intent_ref).await? {
                    Some(status) => status.into(),
                    None => ConfirmationResult::Pending,
                }
            }
            Err(err) => return Err(err.into()),
        };

        if let ConfirmationResult::Captured { amount, .. } = &result
            && amount.currency() != expected.currency()
        {
            tracing::warn!(
                %order_id,
                %expected,
                received = %amount,
                "capture settled in a foreign currency"
            );
            return Err(OrchestratorError::AmountMismatch {
                expected,
                received: *amount,
            });
        }

        self.apply_capture(order_id, intent_id, result).await
    }

    async fn requery(
        &self,
        gateway: &PaymentGateway,
        intent_ref: &IntentRef,
    ) -> Result<Option<ProviderStatus>> {
        match gateway.query_status(intent_ref).await {
            Ok(status) => Ok(Some(status)),
            Err(err) if err.is_unknown_outcome() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn apply_capture(
        &self,
        order_id: AggregateId,
        intent_id: Uuid,
        result: ConfirmationResult,
    ) -> Result<CaptureResult> {
        match result {
            ConfirmationResult::Captured {
                transaction_id,
                amount,
            } => {
                let applied = self
                    .machine
                    .apply(
                        order_id,
                        Transition::PaymentConfirmed {
                            transaction_id,
                            amount,
                            intent_id: Some(intent_id),
                            source: ConfirmationSource::Capture,
                        },
                    )
                    .await?;
                let status = if applied.changed
                    && applied.order.payment_status() == PaymentStatus::Paid
                {
                    CaptureStatus::Captured
                } else {
                    CaptureStatus::AlreadyPaid
                };
                Ok(CaptureResult {
                    order: applied.order,
                    status,
                })
            }
            ConfirmationResult::Declined { reason } => {
                let applied = self
                    .machine
                    .apply(
                        order_id,
                        Transition::PaymentFailed {
                            reason: reason.clone(),
                            intent_id: Some(intent_id),
                        },
                    )
                    .await?;
                Ok(CaptureResult {
                    order: applied.order,
                    status: CaptureStatus::Declined(reason),
                })
            }
            ConfirmationResult::Pending => {
                let order = self
                    .machine
                    .mark_outcome_unknown(order_id, intent_id, "capture outcome unknown")
                    .await?;
                Ok(CaptureResult {
                    order,
                    status: CaptureStatus::Pending,
                })
            }
        }
    }
}

fn check_can_open(order: &Order, method: PaymentMethod) -> Result<()> {
    let expected = order
        .payment_method()
        .ok_or(OrchestratorError::Rejected(OrderError::NotFound))?;
    if expected != method {
        return Err(OrchestratorError::Rejected(OrderError::MethodMismatch {
            expected,
            got: method,
        }));
    }
    if order.payment_status().is_settled() {
        return Err(OrchestratorError::Rejected(OrderError::AlreadyPaid));
    }
    if !method.is_prepaid() || order.is_terminal() {
        return Err(OrchestratorError::Rejected(
            OrderError::InvalidStateTransition {
                from: order.status(),
                action: "open payment",
            },
        ));
    }
    Ok(())
}
