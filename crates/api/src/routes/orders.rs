//! Order placement and the durable order view.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{AggregateId, PaymentMethod};
use domain::{
    Aggregate, Currency, LineItem, Money, Order, PaymentIntent, PlaceOrder, ReconciliationFlag,
    ShippingAddress, ShippingDispatch, UserId,
};
use event_store::EventStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct PlaceOrderRequest {
    pub user_id: Option<Uuid>,
    pub items: Vec<LineItemRequest>,
    /// Currency of every unit price. Defaults to VND.
    #[serde(default)]
    pub currency: Currency,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

#[derive(Deserialize)]
pub struct LineItemRequest {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_minor: i64,
    pub weight_grams: Option<u32>,
}

// -- Response types --

#[derive(Serialize)]
pub struct MoneyView {
    pub amount_minor: i64,
    pub currency: Currency,
    pub display: String,
}

impl From<Money> for MoneyView {
    fn from(money: Money) -> Self {
        Self {
            amount_minor: money.amount_minor(),
            currency: money.currency(),
            display: money.to_decimal_string(),
        }
    }
}

#[derive(Serialize)]
pub struct LineItemView {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: MoneyView,
}

#[derive(Serialize)]
pub struct IntentView {
    pub intent_id: Uuid,
    pub provider: PaymentMethod,
    pub provider_reference: Option<String>,
    pub amount: MoneyView,
    pub status: &'static str,
    pub approval_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&PaymentIntent> for IntentView {
    fn from(intent: &PaymentIntent) -> Self {
        Self {
            intent_id: intent.intent_id,
            provider: intent.provider,
            provider_reference: intent.provider_reference.clone(),
            amount: intent.amount.into(),
            status: intent.status.as_str(),
            approval_url: intent.approval_url.clone(),
            created_at: intent.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct ShipmentView {
    pub shipment_code: String,
    pub carrier_status: &'static str,
    pub cod_amount: MoneyView,
    pub created_at: DateTime<Utc>,
}

impl From<&ShippingDispatch> for ShipmentView {
    fn from(dispatch: &ShippingDispatch) -> Self {
        Self {
            shipment_code: dispatch.shipment_code.clone(),
            carrier_status: dispatch.carrier_status.as_str(),
            cod_amount: dispatch.cod_amount.into(),
            created_at: dispatch.created_at,
        }
    }
}

/// Everything an operator needs to see about one order.
#[derive(Serialize)]
pub struct OrderView {
    pub id: String,
    pub user_id: Option<String>,
    pub status: &'static str,
    pub payment_status: &'static str,
    pub payment_method: Option<PaymentMethod>,
    pub total: MoneyView,
    pub items: Vec<LineItemView>,
    pub shipping_address: Option<ShippingAddress>,
    pub transaction_id: Option<String>,
    pub intents: Vec<IntentView>,
    pub shipment: Option<ShipmentView>,
    pub shipment_pending: bool,
    pub shipment_failures: u32,
    pub last_shipment_error: Option<String>,
    pub flags: Vec<ReconciliationFlag>,
    pub refund_required: bool,
    pub cancellation_reason: Option<String>,
    pub version: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id().map(|id| id.to_string()).unwrap_or_default(),
            user_id: order.user_id().map(|id| id.to_string()),
            status: order.status().as_str(),
            payment_status: order.payment_status().as_str(),
            payment_method: order.payment_method(),
            total: order.total().into(),
            items: order
                .items()
                .iter()
                .map(|item| LineItemView {
                    product_id: item.product_id.to_string(),
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price.into(),
                })
                .collect(),
            shipping_address: order.shipping_address().cloned(),
            transaction_id: order.transaction_id().map(String::from),
            intents: order.intents().iter().map(IntentView::from).collect(),
            shipment: order.dispatch().map(ShipmentView::from),
            shipment_pending: order.shipment_pending(),
            shipment_failures: order.shipment_failures(),
            last_shipment_error: order.last_shipment_error().map(String::from),
            flags: order.flags().to_vec(),
            refund_required: order.refund_required(),
            cancellation_reason: order.cancellation_reason().map(String::from),
            version: order.version().as_i64(),
            created_at: order.created_at(),
            paid_at: order.paid_at(),
            updated_at: order.updated_at(),
        }
    }
}

#[derive(Serialize)]
pub struct PlaceOrderResponse {
    pub order: OrderView,
    /// First payment intent of a prepaid order.
    pub payment: Option<IntentView>,
    /// Set when the order was recorded but the provider could not open a
    /// payment; the client retries through `create-order`.
    pub payment_error: Option<String>,
}

// -- Handlers --

/// POST /orders: record an order and start its payment or shipment.
#[tracing::instrument(skip(state, req), fields(method = %req.payment_method))]
pub async fn place<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<PlaceOrderResponse>), ApiError> {
    let user_id = req.user_id.map(UserId::from_uuid).unwrap_or_default();
    let items = req
        .items
        .into_iter()
        .map(|item| {
            let line = LineItem::new(
                item.product_id.as_str(),
                item.name,
                item.quantity,
                Money::new(item.unit_price_minor, req.currency),
            );
            match item.weight_grams {
                Some(weight) => line.with_weight(weight),
                None => line,
            }
        })
        .collect();

    let cmd = PlaceOrder::new(user_id, items, req.shipping_address, req.payment_method);
    let checkout = state.checkout.place_order(cmd).await?;

    Ok((
        StatusCode::CREATED,
        Json(PlaceOrderResponse {
            order: OrderView::from(&checkout.order),
            payment: checkout.intent.as_ref().map(IntentView::from),
            payment_error: checkout.payment_error,
        }),
    ))
}

/// GET /orders/:id: the order as durably recorded.
#[tracing::instrument(skip(state))]
pub async fn get<S: EventStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state.machine.load(order_id).await?;
    Ok(Json(OrderView::from(&order)))
}

pub(crate) fn parse_order_id(id: &str) -> Result<AggregateId, ApiError> {
    let uuid = Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid order id: {e}")))?;
    Ok(AggregateId::from_uuid(uuid))
}
