//! Periodic reconciliation of payments the provider never called back about.
//!
//! Definitive provider answers go through [`OrderStateMachine::apply`], the
//! same path webhooks take, so a callback racing the sweep is harmless.
//! Every order is handled on its own: a crash mid-sweep leaves each order
//! either reconciled or untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Aggregate, ConfirmationSource, Order, PaymentIntent, PaymentStatus};
use event_store::{EventStore, ReceiptStore};
use futures_util::StreamExt;
use gateways::{GatewayError, GatewayRegistry, IntentRef, ProviderStatus};
use tokio::sync::watch;

use crate::error::{OrchestratorError, Result};
use crate::state_machine::OrderStateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Age after which a live intent or an unfinished settlement is looked at.
    pub window: Duration,
    /// Age after which a still-pending intent expires.
    pub intent_ttl: Duration,
    /// How long webhook receipts are kept for de-duplication.
    pub receipt_retention: Duration,
    /// Orders reconciled at the same time.
    pub concurrency: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            window: Duration::from_secs(5 * 60),
            intent_ttl: Duration::from_secs(24 * 60 * 60),
            receipt_retention: Duration::from_secs(72 * 60 * 60),
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub expired: usize,
    pub settled: usize,
    pub flagged: usize,
    pub still_pending: usize,
    pub errors: usize,
    pub receipts_purged: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Skipped,
    Confirmed,
    Failed,
    Expired,
    Settled,
    Flagged,
    StillPending,
}

impl SweepReport {
    fn record(&mut self, action: Action) {
        match action {
            Action::Skipped => {}
            Action::Confirmed => self.confirmed += 1,
            Action::Failed => self.failed += 1,
            Action::Expired => self.expired += 1,
            Action::Settled => self.settled += 1,
            Action::Flagged => self.flagged += 1,
            Action::StillPending => self.still_pending += 1,
        }
    }
}

pub struct ReconciliationPoller<S: EventStore> {
    machine: Arc<OrderStateMachine<S>>,
    gateways: GatewayRegistry,
    receipts: Arc<dyn ReceiptStore>,
    config: PollerConfig,
}

impl<S: EventStore> ReconciliationPoller<S> {
    pub fn new(
        machine: Arc<OrderStateMachine<S>>,
        gateways: GatewayRegistry,
        receipts: Arc<dyn ReceiptStore>,
    ) -> Self {
        Self {
            machine,
            gateways,
            receipts,
            config: PollerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.config.interval.as_secs(), "reconciliation poller started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        metrics::counter!("reconciliation_errors_total").increment(1);
                        tracing::error!(error = %err, "reconciliation sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("reconciliation poller stopping");
                        break;
                    }
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass over every open order, as of `now`.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let candidates = self.machine.orders().find_open_orders().await?;
        let window = span(self.config.window);

        let results: Vec<_> = futures_util::stream::iter(candidates)
            .map(|order_id| async move {
                (order_id, self.reconcile_at(order_id, now, window).await)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (order_id, result) in results {
            report.examined += 1;
            match result {
                Ok((_, action)) => report.record(action),
                Err(err) => {
                    report.errors += 1;
                    metrics::counter!("reconciliation_errors_total").increment(1);
                    tracing::warn!(%order_id, error = %err, "order reconciliation failed");
                }
            }
        }

        let cutoff = now
            .checked_sub_signed(span(self.config.receipt_retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self.receipts.purge_older_than(cutoff).await {
            Ok(purged) => report.receipts_purged = purged,
            Err(err) => {
                report.errors += 1;
                tracing::warn!(error = %err, "receipt purge failed");
            }
        }

        metrics::counter!("reconciliation_sweeps_total").increment(1);
        tracing::info!(
            examined = report.examined,
            confirmed = report.confirmed,
            failed = report.failed,
            expired = report.expired,
            settled = report.settled,
            errors = report.errors,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Reconciles one order now, without waiting for the window.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_order(&self, order_id: AggregateId) -> Result<Order> {
        self.reconcile_at(order_id, Utc::now(), chrono::Duration::zero())
            .await
            .map(|(order, _)| order)
    }

    async fn reconcile_at(
        &self,
        order_id: AggregateId,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<(Order, Action)> {
        let order = self.machine.load(order_id).await?;
        if order.is_terminal() {
            return Ok((order, Action::Skipped));
        }

        if order.needs_settlement() {
            // Always the configured window: a younger settlement may still be running.
            let since = order.paid_at().or(order.created_at()).unwrap_or(now);
            if !order.shipment_pending() && now - since >= span(self.config.window) {
                tracing::info!(%order_id, cod = order.is_cod(), "resuming interrupted settlement");
                let order = self.machine.resume_settlement(order_id).await?;
                return Ok((order, Action::Settled));
            }
            return Ok((order, Action::Skipped));
        }
        if order.payment_status() == PaymentStatus::Paid {
            return Ok((order, Action::Skipped));
        }

        let Some(intent) = order.live_intent().cloned() else {
            return Ok((order, Action::Skipped));
        };
        if now - intent.created_at < window {
            return Ok((order, Action::Skipped));
        }
        self.reconcile_intent(order, intent, now).await
    }

    async fn reconcile_intent(
        &self,
        order: Order,
        intent: PaymentIntent,
        now: DateTime<Utc>,
    ) -> Result<(Order, Action)> {
        let Some(order_id) = order.id() else {
            return Ok((order, Action::Skipped));
        };
        let gateway = self.gateways.get(intent.provider)?;
        let intent_ref = IntentRef {
            order_id,
            provider_reference: intent.provider_reference.clone(),
        };

        let status = match gateway.query_status(&intent_ref).await {
            Ok(status) => status,
            Err(GatewayError::UnknownReference(_)) => ProviderStatus::Pending,
            Err(err) if err.is_unknown_outcome() => ProviderStatus::Pending,
            Err(err) => return Err(err.into()),
        };

        let action = match &status {
            ProviderStatus::Paid { .. } => Action::Confirmed,
            ProviderStatus::Failed { .. } => Action::Failed,
            ProviderStatus::Pending => {
                return self.settle_pending(order, &intent, now).await;
            }
        };

        tracing::info!(%order_id, status = ?status, "provider reported a definitive result");
        match self
            .machine
            .apply_provider_status(
                order_id,
                Some(intent.intent_id),
                status,
                ConfirmationSource::Reconciliation,
            )
            .await
        {
            Ok(Some(applied)) => Ok((applied.order, action)),
            Ok(None) => Ok((order, Action::StillPending)),
            Err(OrchestratorError::AmountMismatch { .. }) => {
                let order = self.machine.load(order_id).await?;
                Ok((order, Action::Flagged))
            }
            Err(err) => Err(err),
        }
    }

    async fn settle_pending(
        &self,
        order: Order,
        intent: &PaymentIntent,
        now: DateTime<Utc>,
    ) -> Result<(Order, Action)> {
        let Some(order_id) = order.id() else {
            return Ok((order, Action::Skipped));
        };
        if now - intent.created_at >= span(self.config.intent_ttl) {
            tracing::info!(%order_id, intent_id = %intent.intent_id, "payment intent expired");
            let order = self.machine.expire_intent(order_id, intent.intent_id).await?;
            return Ok((order, Action::Expired));
        }
        let order = self
            .machine
            .mark_outcome_unknown(order_id, intent.intent_id, "no callback within window")
            .await?;
        Ok((order, Action::StillPending))
    }
}

fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
