//! Carrier shipments.
//!
//! [`ShippingDispatchAdapter`] turns an order into a carrier shipment and
//! back. Shipments are created under the order id as client order code,
//! so after a timeout the adapter looks the shipment up before it tries
//! again and never creates a second one.

mod ghn;
mod sandbox;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Aggregate, CarrierStatus, Money, Order, Parcel, ShippingAddress, ShippingDispatch,
};
use serde::{Deserialize, Serialize};

use crate::error::ShippingError;
use crate::retry::RetryPolicy;

pub use ghn::{CarrierConfig, HttpCarrierClient, carrier_status_from};
pub use sandbox::InMemoryCarrier;

/// One line of the parcel manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentItem {
    pub code: String,
    pub name: String,
    pub quantity: u32,
    pub weight_grams: u32,
}

/// Everything the carrier needs to pick up and deliver a parcel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    /// Our order id. The carrier de-duplicates on it.
    pub client_order_code: String,
    pub recipient: ShippingAddress,
    pub items: Vec<ShipmentItem>,
    pub parcel: Parcel,
    /// Cash the carrier collects on delivery. Zero for prepaid orders.
    pub cod_amount: Money,
}

/// A shipment as the carrier knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierShipment {
    pub shipment_code: String,
    pub client_order_code: String,
    pub status: CarrierStatus,
    pub created_at: DateTime<Utc>,
}

/// Carrier API.
#[async_trait]
pub trait ShippingCarrier: Send + Sync {
    async fn create_order(&self, request: &ShipmentRequest) -> Result<CarrierShipment, ShippingError>;

    /// Finds a shipment by our order id.
    async fn find_by_client_code(
        &self,
        client_order_code: &str,
    ) -> Result<Option<CarrierShipment>, ShippingError>;

    async fn detail(&self, shipment_code: &str) -> Result<CarrierShipment, ShippingError>;

    /// Cancels a shipment. Fails with [`ShippingError::AlreadyPickedUp`]
    /// once the parcel has left the shop.
    async fn cancel(&self, shipment_code: &str) -> Result<(), ShippingError>;
}

/// Creates, tracks and cancels the shipment of an order.
#[derive(Clone)]
pub struct ShippingDispatchAdapter {
    carrier: Arc<dyn ShippingCarrier>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for ShippingDispatchAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShippingDispatchAdapter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ShippingDispatchAdapter {
    pub fn new(carrier: Arc<dyn ShippingCarrier>) -> Self {
        Self {
            carrier,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Builds the carrier request for a placed order.
    pub fn request_for(order: &Order) -> Result<ShipmentRequest, ShippingError> {
        let order_id = order
            .id()
            .ok_or_else(|| ShippingError::Rejected("order has not been placed".into()))?;
        let recipient = order
            .shipping_address()
            .cloned()
            .ok_or_else(|| ShippingError::Rejected("order has no shipping address".into()))?;

        let cod_amount = if order.is_cod() {
            order.total()
        } else {
            Money::zero(order.total().currency())
        };

        Ok(ShipmentRequest {
            client_order_code: order_id.to_string(),
            recipient,
            items: order
                .items()
                .iter()
                .map(|item| ShipmentItem {
                    code: item.product_id.as_str().to_string(),
                    name: item.name.clone(),
                    quantity: item.quantity,
                    weight_grams: item.weight_grams,
                })
                .collect(),
            parcel: Parcel::for_items(order.items()),
            cod_amount,
        })
    }

    /// Creates the shipment, retrying transient failures. Before every
    /// retry the carrier is asked whether the previous attempt landed.
    #[tracing::instrument(skip(self, order), fields(order_id = ?order.id()))]
    pub async fn create(&self, order: &Order) -> Result<ShippingDispatch, ShippingError> {
        let request = Self::request_for(order)?;
        self.create_with_retry(&request, false).await
    }

    /// Same as [`create`](Self::create), but looks the shipment up first.
    /// Used when an earlier run may have created it already.
    #[tracing::instrument(skip(self, order), fields(order_id = ?order.id()))]
    pub async fn recover(&self, order: &Order) -> Result<ShippingDispatch, ShippingError> {
        let request = Self::request_for(order)?;
        self.create_with_retry(&request, true).await
    }

    async fn create_with_retry(
        &self,
        request: &ShipmentRequest,
        lookup_first: bool,
    ) -> Result<ShippingDispatch, ShippingError> {
        let mut last_error = ShippingError::Timeout;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay_for(attempt - 1)).await;
            }

            if attempt > 1 || lookup_first {
                match self
                    .policy
                    .timed(self.carrier.find_by_client_code(&request.client_order_code))
                    .await
                {
                    Ok(Some(existing)) => {
                        tracing::info!(
                            shipment_code = %existing.shipment_code,
                            attempt,
                            "found shipment from an earlier attempt"
                        );
                        return Ok(dispatch_from(request, existing));
                    }
                    Ok(None) => {}
                    Err(err) if err.is_transient() => {
                        tracing::warn!(attempt, error = %err, "shipment lookup failed");
                        last_error = err;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            match self.policy.timed(self.carrier.create_order(request)).await {
                Ok(shipment) => {
                    tracing::info!(shipment_code = %shipment.shipment_code, attempt, "shipment created");
                    return Ok(dispatch_from(request, shipment));
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(attempt, error = %err, "shipment creation outcome unknown");
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }

        tracing::error!(
            attempts = self.policy.max_attempts,
            error = %last_error,
            "shipment creation gave up"
        );
        Err(last_error)
    }

    /// Cancels a shipment. `Ok(false)` when the carrier does not know it.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, shipment_code: &str) -> Result<bool, ShippingError> {
        match self.policy.timed(self.carrier.cancel(shipment_code)).await {
            Ok(()) => Ok(true),
            Err(ShippingError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn track(&self, shipment_code: &str) -> Result<CarrierStatus, ShippingError> {
        self.policy
            .timed(self.carrier.detail(shipment_code))
            .await
            .map(|shipment| shipment.status)
    }
}

fn dispatch_from(request: &ShipmentRequest, shipment: CarrierShipment) -> ShippingDispatch {
    ShippingDispatch {
        shipment_code: shipment.shipment_code,
        reference: request.client_order_code.clone(),
        cod_amount: request.cod_amount,
        parcel: request.parcel,
        carrier_status: shipment.status,
        created_at: shipment.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PaymentMethod;
    use domain::{Currency, LineItem, PlaceOrder, UserId};

    fn order(method: PaymentMethod) -> Order {
        let cmd = PlaceOrder::new(
            UserId::new(),
            vec![
                LineItem::new("SKU-TEE", "T-shirt", 2, Money::new(75_000, Currency::Vnd)),
                LineItem::new("SKU-CAP", "Cap", 1, Money::new(20_500, Currency::Vnd)),
            ],
            ShippingAddress {
                recipient_name: "Tran B".into(),
                phone: "0912345678".into(),
                street: "12 Le Loi".into(),
                ward: "Ben Nghe".into(),
                district: "District 1".into(),
                province: "Ho Chi Minh".into(),
                note: None,
            },
            method,
        );
        let mut order = Order::default();
        let events = order.place(&cmd).unwrap();
        order.apply_events(events);
        order
    }

    fn adapter(carrier: &InMemoryCarrier) -> ShippingDispatchAdapter {
        ShippingDispatchAdapter::new(Arc::new(carrier.clone()))
            .with_policy(RetryPolicy::default().immediate())
    }

    #[tokio::test]
    async fn prepaid_shipment_collects_nothing() {
        let carrier = InMemoryCarrier::new();
        let dispatch = adapter(&carrier)
            .create(&order(PaymentMethod::SignedCallback))
            .await
            .unwrap();

        assert_eq!(dispatch.cod_amount, Money::zero(Currency::Vnd));
        assert_eq!(dispatch.carrier_status, CarrierStatus::ReadyToPick);
        assert_eq!(dispatch.parcel.weight_grams, 600);
        assert_eq!(carrier.create_calls(), 1);
    }

    #[tokio::test]
    async fn cod_shipment_collects_total() {
        let carrier = InMemoryCarrier::new();
        let dispatch = adapter(&carrier)
            .create(&order(PaymentMethod::Cod))
            .await
            .unwrap();

        assert_eq!(dispatch.cod_amount, Money::new(170_500, Currency::Vnd));
        assert_eq!(
            carrier.last_request().unwrap().cod_amount,
            Money::new(170_500, Currency::Vnd)
        );
    }

    #[tokio::test]
    async fn timeout_after_carrier_created_is_resolved_by_lookup() {
        let carrier = InMemoryCarrier::new();
        carrier.set_create_times_out(true);
        let order = order(PaymentMethod::Cod);

        let dispatch = adapter(&carrier).create(&order).await.unwrap();

        assert_eq!(carrier.create_calls(), 1);
        assert_eq!(carrier.shipment_count(), 1);
        assert_eq!(dispatch.reference, order.id().unwrap().to_string());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let carrier = InMemoryCarrier::new();
        carrier.fail_next_creates(2);

        adapter(&carrier)
            .create(&order(PaymentMethod::Cod))
            .await
            .unwrap();

        assert_eq!(carrier.create_calls(), 3);
        assert_eq!(carrier.shipment_count(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let carrier = InMemoryCarrier::new();
        carrier.fail_next_creates(10);

        let err = adapter(&carrier)
            .create(&order(PaymentMethod::Cod))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(carrier.create_calls(), 3);
        assert_eq!(carrier.shipment_count(), 0);
    }

    #[tokio::test]
    async fn recover_finds_existing_shipment() {
        let carrier = InMemoryCarrier::new();
        let order = order(PaymentMethod::Cod);
        let adapter = adapter(&carrier);
        let first = adapter.create(&order).await.unwrap();

        let recovered = adapter.recover(&order).await.unwrap();
        assert_eq!(recovered.shipment_code, first.shipment_code);
        assert_eq!(carrier.create_calls(), 1);
    }

    #[tokio::test]
    async fn cancel_after_pickup_is_refused() {
        let carrier = InMemoryCarrier::new();
        let adapter = adapter(&carrier);
        let dispatch = adapter.create(&order(PaymentMethod::Cod)).await.unwrap();
        carrier.set_status(&dispatch.shipment_code, CarrierStatus::PickedUp);

        let err = adapter.cancel(&dispatch.shipment_code).await.unwrap_err();
        assert_eq!(err, ShippingError::AlreadyPickedUp(dispatch.shipment_code.clone()));
        assert_eq!(
            adapter.track(&dispatch.shipment_code).await.unwrap(),
            CarrierStatus::PickedUp
        );
    }

    #[tokio::test]
    async fn cancel_before_pickup_succeeds() {
        let carrier = InMemoryCarrier::new();
        let adapter = adapter(&carrier);
        let dispatch = adapter.create(&order(PaymentMethod::Cod)).await.unwrap();

        assert!(adapter.cancel(&dispatch.shipment_code).await.unwrap());
        assert_eq!(
            adapter.track(&dispatch.shipment_code).await.unwrap(),
            CarrierStatus::Cancelled
        );
        assert!(!adapter.cancel("GHN-UNKNOWN").await.unwrap());
    }
}
