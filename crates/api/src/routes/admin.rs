//! Operator endpoints: overrides, cancellation, manual payment, shipment
//! retry and tracking, on-demand reconciliation.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use domain::{ConfirmationSource, Money, OrderStatus};
use event_store::EventStore;
use orchestrator::{SweepReport, Transition};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::orders::{OrderView, parse_order_id};
use crate::state::AppState;

const DEFAULT_ACTOR: &str = "admin";

#[derive(Deserialize)]
pub struct StatusOverrideRequest {
    pub status: String,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    pub actor: Option<String>,
    pub reason: Option<String>,
}

/// Cash collected by the carrier, a bank transfer, or any payment taken
/// outside the configured rails.
#[derive(Deserialize, Default)]
pub struct ManualPaymentRequest {
    pub transaction_id: Option<String>,
    /// Defaults to the order total.
    pub amount_minor: Option<i64>,
    pub actor: Option<String>,
}

#[derive(Serialize)]
pub struct TransitionResponse {
    pub changed: bool,
    pub order: OrderView,
}

#[derive(Serialize)]
pub struct SweepResponse {
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

impl From<SweepReport> for SweepResponse {
    fn from(report: SweepReport) -> Self {
        Self {
            examined: report.examined,
            confirmed: report.confirmed,
            failed: report.failed,
            expired: report.expired,
            settled: report.settled,
            flagged: report.flagged,
            still_pending: report.still_pending,
            errors: report.errors,
            receipts_purged: report.receipts_purged,
        }
    }
}

fn actor(actor: Option<String>) -> String {
    actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

/// POST /admin/orders/:id/status
#[tracing::instrument(skip(state, req), fields(to = %req.status))]
pub async fn override_status<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<StatusOverrideRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let to: OrderStatus = req.status.parse().map_err(ApiError::BadRequest)?;
    let actor = actor(req.actor);
    tracing::info!(%order_id, %actor, "manual status override requested");

    let applied = state
        .machine
        .apply(
            order_id,
            Transition::ManualStatusOverride {
                to,
                actor,
                reason: req.reason,
            },
        )
        .await?;
    Ok(Json(TransitionResponse {
        changed: applied.changed,
        order: OrderView::from(&applied.order),
    }))
}

/// POST /admin/orders/:id/cancel
#[tracing::instrument(skip(state, req))]
pub async fn cancel<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    req: Option<Json<CancelRequest>>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let req = req.map(|Json(req)| req).unwrap_or_default();

    let applied = state
        .machine
        .apply(
            order_id,
            Transition::CancelRequested {
                actor: actor(req.actor),
                reason: req.reason,
            },
        )
        .await?;
    Ok(Json(TransitionResponse {
        changed: applied.changed,
        order: OrderView::from(&applied.order),
    }))
}

/// POST /admin/orders/:id/payment: record a payment taken outside the
/// provider rails. Goes through the same confirmation as a callback, so
/// the amount check and settlement apply.
#[tracing::instrument(skip(state, req))]
pub async fn record_payment<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    req: Option<Json<ManualPaymentRequest>>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let req = req.map(|Json(req)| req).unwrap_or_default();
    let order = state.machine.load(order_id).await?;

    let total = order.total();
    let amount = req
        .amount_minor
        .map(|minor| Money::new(minor, total.currency()))
        .unwrap_or(total);
    let actor = actor(req.actor);
    let transaction_id = req
        .transaction_id
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("manual-{order_id}"));
    tracing::info!(%order_id, %actor, %transaction_id, "manual payment recorded");

    let applied = state
        .machine
        .apply(
            order_id,
            Transition::PaymentConfirmed {
                transaction_id,
                amount,
                intent_id: None,
                source: ConfirmationSource::Manual,
            },
        )
        .await?;
    Ok(Json(TransitionResponse {
        changed: applied.changed,
        order: OrderView::from(&applied.order),
    }))
}

/// POST /admin/orders/:id/shipment/retry
#[tracing::instrument(skip(state))]
pub async fn retry_shipment<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state.machine.retry_shipment(order_id).await?;
    Ok(Json(OrderView::from(&order)))
}

/// POST /admin/orders/:id/shipment/track
#[tracing::instrument(skip(state))]
pub async fn track_shipment<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state.machine.refresh_carrier_status(order_id).await?;
    Ok(Json(OrderView::from(&order)))
}

/// POST /admin/reconciliation/sweep
#[tracing::instrument(skip(state))]
pub async fn sweep<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<SweepResponse>, ApiError> {
    let report = state.poller.sweep_once().await?;
    Ok(Json(report.into()))
}
