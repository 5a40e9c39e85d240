//! Inbound payment callbacks.
//!
//! Every callback is hashed and looked up in the receipt table before
//! anything else. Only a callback whose signature checks out is stored,
//! and its receipt is marked processed only after the order transition is
//! durable. Anything that fails transiently is answered with a retryable
//! outcome so the provider delivers again.

use std::sync::Arc;

use common::PaymentMethod;
use domain::ConfirmationSource;
use event_store::{EventStore, ReceiptStore, RecordOutcome, WebhookReceipt, payload_hash};
use gateways::{CallbackError, CallbackNotice, GatewayRegistry, ProviderStatus};

use crate::error::{ErrorClass, OrchestratorError};
use crate::state_machine::OrderStateMachine;

/// What the ingestor did with a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The callback was applied, or recorded as a flag, durably.
    Processed,
    /// The same payload was already processed.
    Duplicate,
    /// The order had already reached the state the callback reports.
    AlreadySettled,
    InvalidSignature,
    Malformed(String),
    UnknownOrder,
    /// Flagged for operators, not applied.
    AmountMismatch,
    /// Ask the provider to deliver again.
    Retry(String),
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::AlreadySettled => "already_settled",
            WebhookOutcome::InvalidSignature => "invalid_signature",
            WebhookOutcome::Malformed(_) => "malformed",
            WebhookOutcome::UnknownOrder => "unknown_order",
            WebhookOutcome::AmountMismatch => "amount_mismatch",
            WebhookOutcome::Retry(_) => "retry",
        }
    }
}

pub struct WebhookIngestor<S: EventStore> {
    machine: Arc<OrderStateMachine<S>>,
    gateways: GatewayRegistry,
    receipts: Arc<dyn ReceiptStore>,
}

impl<S: EventStore> WebhookIngestor<S> {
    pub fn new(
        machine: Arc<OrderStateMachine<S>>,
        gateways: GatewayRegistry,
        receipts: Arc<dyn ReceiptStore>,
    ) -> Self {
        Self {
            machine,
            gateways,
            receipts,
        }
    }

    #[tracing::instrument(skip(self, body), fields(provider = %provider, bytes = body.len()))]
    pub async fn ingest(&self, provider: PaymentMethod, body: &[u8]) -> WebhookOutcome {
        metrics::counter!("webhook_received_total", "provider" => provider.as_str()).increment(1);
        let outcome = self.ingest_inner(provider, body).await;
        if outcome == WebhookOutcome::Duplicate {
            metrics::counter!("webhook_duplicates_total", "provider" => provider.as_str())
                .increment(1);
        }
        tracing::info!(outcome = outcome.as_str(), "callback handled");
        outcome
    }

    async fn ingest_inner(&self, provider: PaymentMethod, body: &[u8]) -> WebhookOutcome {
        let hash = payload_hash(provider.as_str(), body);
        match self.receipts.find(&hash).await {
            Ok(Some(receipt)) if receipt.processed => return WebhookOutcome::Duplicate,
            Ok(_) => {}
            Err(err) => return WebhookOutcome::Retry(err.to_string()),
        }

        let gateway = match self.gateways.get(provider) {
            Ok(gateway) => gateway,
            Err(err) => return WebhookOutcome::Malformed(err.to_string()),
        };
        let notice = match gateway.parse_callback(body) {
            Ok(notice) => notice,
            Err(CallbackError::InvalidSignature) => {
                metrics::counter!("webhook_signature_failures_total", "provider" => provider.as_str())
                    .increment(1);
                tracing::warn!(payload_hash = %hash, "callback rejected: invalid signature");
                return WebhookOutcome::InvalidSignature;
            }
            Err(err) => {
                tracing::warn!(error = %err, "callback rejected");
                return WebhookOutcome::Malformed(err.to_string());
            }
        };

        let receipt = WebhookReceipt::validated(provider.as_str(), &hash, &notice.correlation_key);
        match self.receipts.record(receipt).await {
            Ok(RecordOutcome::Existing(existing)) if existing.processed => {
                return WebhookOutcome::Duplicate;
            }
            Ok(RecordOutcome::Existing(_)) => {
                tracing::info!(correlation_key = %notice.correlation_key, "re-applying unprocessed callback");
            }
            Ok(RecordOutcome::Inserted(_)) => {}
            Err(err) => return WebhookOutcome::Retry(err.to_string()),
        }

        let outcome = self.apply(&notice).await;
        let done = matches!(
            outcome,
            WebhookOutcome::Processed
                | WebhookOutcome::AlreadySettled
                | WebhookOutcome::AmountMismatch
        );
        if !done {
            return outcome;
        }

        match self
            .receipts
            .mark_processed(&hash, &notice.correlation_key, outcome.as_str())
            .await
        {
            Ok(_) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "transition applied but receipt not marked");
                WebhookOutcome::Retry(err.to_string())
            }
        }
    }

    async fn apply(&self, notice: &CallbackNotice) -> WebhookOutcome {
        let order_id = notice.order_id;
        let order = match self.machine.load(order_id).await {
            Ok(order) => order,
            Err(OrchestratorError::OrderNotFound(_)) => {
                tracing::warn!(%order_id, "callback for unknown order");
                return WebhookOutcome::UnknownOrder;
            }
            Err(err) => return WebhookOutcome::Retry(err.to_string()),
        };
        let intent_id = order
            .intent_by_reference(&notice.provider_reference)
            .map(|intent| intent.intent_id);

        // A decline for an attempt this order never opened says nothing
        // about the live intent.
        if intent_id.is_none() && matches!(notice.status, ProviderStatus::Failed { .. }) {
            tracing::warn!(
                %order_id,
                provider_reference = %notice.provider_reference,
                "decline for unknown payment attempt ignored"
            );
            return WebhookOutcome::AlreadySettled;
        }

        let result = self
            .machine
            .apply_provider_status(
                order_id,
                intent_id,
                notice.status.clone(),
                ConfirmationSource::Webhook,
            )
            .await;

        match result {
            Ok(Some(applied)) if applied.changed => WebhookOutcome::Processed,
            Ok(Some(_)) => WebhookOutcome::AlreadySettled,
            // Still pending at the provider; nothing to apply.
            Ok(None) => WebhookOutcome::Processed,
            Err(OrchestratorError::AmountMismatch { .. }) => WebhookOutcome::AmountMismatch,
            Err(OrchestratorError::PaymentAfterCancellation(_)) => WebhookOutcome::Processed,
            Err(OrchestratorError::OrderNotFound(_)) => WebhookOutcome::UnknownOrder,
            Err(err) => match err.class() {
                ErrorClass::Conflict => WebhookOutcome::AlreadySettled,
                ErrorClass::Validation => WebhookOutcome::Malformed(err.to_string()),
                _ => WebhookOutcome::Retry(err.to_string()),
            },
        }
    }
}
