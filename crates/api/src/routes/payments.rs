//! Provider-facing payment endpoints: intents, capture, callbacks, status.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::PaymentMethod;
use event_store::EventStore;
use gateways::GatewayError;
use orchestrator::{CaptureStatus, OrchestratorError, WebhookOutcome};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::orders::{IntentView, parse_order_id};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: String,
}

#[derive(Deserialize)]
pub struct CaptureRequest {
    pub order_id: String,
    /// Provider order token from the approval redirect. The live intent is
    /// used when absent.
    pub provider_reference: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct StatusQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Serialize)]
pub struct CreatePaymentResponse {
    pub order_id: String,
    pub order_status: &'static str,
    pub intent: IntentView,
}

#[derive(Serialize)]
pub struct CaptureResponse {
    pub order_id: String,
    pub capture: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub order_status: &'static str,
    pub payment_status: &'static str,
    pub transaction_id: Option<String>,
}

#[derive(Serialize)]
pub struct PaymentStatusResponse {
    pub order_id: String,
    pub provider: PaymentMethod,
    pub order_status: &'static str,
    pub payment_status: &'static str,
    pub transaction_id: Option<String>,
    pub intent: Option<IntentView>,
    /// Carrier code once the paid order has been handed to shipping.
    pub shipment_code: Option<String>,
    /// Shipment creation exhausted its retries and awaits an admin retry.
    pub shipment_pending: bool,
}

/// Callback acknowledgement in the provider's response-code vocabulary.
#[derive(Debug, Serialize)]
pub struct CallbackAck {
    pub rsp_code: &'static str,
    pub message: String,
}

fn parse_provider(provider: &str) -> Result<PaymentMethod, ApiError> {
    provider
        .parse()
        .map_err(|e: common::UnknownPaymentMethod| ApiError::BadRequest(e.to_string()))
}

/// POST /payments/:provider/create-order: open (or return the live)
/// payment intent for an order.
#[tracing::instrument(skip(state, req))]
pub async fn create_order<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(provider): Path<String>,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), ApiError> {
    let method = parse_provider(&provider)?;
    let order_id = parse_order_id(&req.order_id)?;

    let opened = state.checkout.open_payment(order_id, method).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatePaymentResponse {
            order_id: order_id.to_string(),
            order_status: opened.order.status().as_str(),
            intent: IntentView::from(&opened.intent),
        }),
    ))
}

/// POST /payments/:provider/capture: capture an approved redirect payment.
///
/// Answers 200 when the order is paid, 202 when the provider outcome is
/// still unknown and 402 when the provider declined.
#[tracing::instrument(skip(state, req))]
pub async fn capture<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(provider): Path<String>,
    Json(req): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<CaptureResponse>), ApiError> {
    let method = parse_provider(&provider)?;
    if method != PaymentMethod::RedirectCapture {
        return Err(OrchestratorError::from(GatewayError::Unsupported {
            provider: method,
            operation: "capture",
        })
        .into());
    }
    let order_id = parse_order_id(&req.order_id)?;

    let result = state.checkout.capture(order_id, req.provider_reference).await?;
    let (status, capture, reason) = match result.status {
        CaptureStatus::Captured => (StatusCode::OK, "captured", None),
        CaptureStatus::AlreadyPaid => (StatusCode::OK, "already_paid", None),
        CaptureStatus::Pending => (StatusCode::ACCEPTED, "pending", None),
        CaptureStatus::Declined(reason) => {
            (StatusCode::PAYMENT_REQUIRED, "declined", Some(reason))
        }
    };
    Ok((
        status,
        Json(CaptureResponse {
            order_id: order_id.to_string(),
            capture,
            reason,
            order_status: result.order.status().as_str(),
            payment_status: result.order.payment_status().as_str(),
            transaction_id: result.order.transaction_id().map(String::from),
        }),
    ))
}

/// POST /payments/:provider/callback: signed payment notification.
///
/// Never fails with an error body: the provider only understands the
/// response code. Retryable outcomes answer 503 so it delivers again.
#[tracing::instrument(skip(state, body))]
pub async fn callback<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(provider): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<CallbackAck>) {
    let method = match provider.parse::<PaymentMethod>() {
        Ok(method) => method,
        Err(err) => return ack(StatusCode::BAD_REQUEST, "99", err.to_string()),
    };

    match state.webhooks.ingest(method, &body).await {
        WebhookOutcome::Processed => ack(StatusCode::OK, "00", "processed"),
        WebhookOutcome::Duplicate => ack(StatusCode::OK, "02", "duplicate"),
        WebhookOutcome::AlreadySettled => ack(StatusCode::OK, "02", "already settled"),
        WebhookOutcome::UnknownOrder => ack(StatusCode::OK, "01", "order not found"),
        WebhookOutcome::AmountMismatch => ack(StatusCode::OK, "04", "amount mismatch"),
        WebhookOutcome::InvalidSignature => ack(StatusCode::BAD_REQUEST, "97", "invalid signature"),
        WebhookOutcome::Malformed(reason) => ack(StatusCode::BAD_REQUEST, "99", reason),
        WebhookOutcome::Retry(reason) => ack(StatusCode::SERVICE_UNAVAILABLE, "99", reason),
    }
}

fn ack(
    status: StatusCode,
    rsp_code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<CallbackAck>) {
    metrics::counter!("callback_responses_total", "rsp_code" => rsp_code).increment(1);
    (
        status,
        Json(CallbackAck {
            rsp_code,
            message: message.into(),
        }),
    )
}

/// GET /payments/:provider/status/:order_id: payment status as recorded,
/// or freshly reconciled with the provider when `?refresh=true`.
#[tracing::instrument(skip(state, query), fields(refresh = query.refresh))]
pub async fn status<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((provider, order_id)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<PaymentStatusResponse>, ApiError> {
    let method = parse_provider(&provider)?;
    let order_id = parse_order_id(&order_id)?;

    let order = state.machine.load(order_id).await?;
    if order.payment_method() != Some(method) {
        return Err(ApiError::BadRequest(format!(
            "order {order_id} is not paid through {method}"
        )));
    }
    let order = if query.refresh {
        state.poller.reconcile_order(order_id).await?
    } else {
        order
    };

    Ok(Json(PaymentStatusResponse {
        order_id: order_id.to_string(),
        provider: method,
        order_status: order.status().as_str(),
        payment_status: order.payment_status().as_str(),
        transaction_id: order.transaction_id().map(String::from),
        intent: order.latest_intent().map(IntentView::from),
        shipment_code: order.dispatch().map(|d| d.shipment_code.clone()),
        shipment_pending: order.shipment_pending(),
    }))
}
