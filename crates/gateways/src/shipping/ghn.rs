//! HTTP client for a GHN-style carrier API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use domain::CarrierStatus;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{CarrierShipment, ShipmentRequest, ShippingCarrier};
use crate::error::ShippingError;

pub const SANDBOX_BASE_URL: &str = "https://dev-online-gateway.ghn.vn";
pub const LIVE_BASE_URL: &str = "https://online-gateway.ghn.vn";

const API_PREFIX: &str = "/shiip/public-api/v2";

/// Maps a carrier status string onto [`CarrierStatus`].
pub fn carrier_status_from(status: &str) -> Option<CarrierStatus> {
    let status = match status {
        "ready_to_pick" => CarrierStatus::ReadyToPick,
        "picking" | "money_collect_picking" => CarrierStatus::Picking,
        "picked" => CarrierStatus::PickedUp,
        "storing" | "transporting" | "sorting" | "delivering" | "money_collect_delivering"
        | "delivery_fail" | "waiting_to_return" | "exception" => CarrierStatus::InTransit,
        "delivered" => CarrierStatus::Delivered,
        "cancel" => CarrierStatus::Cancelled,
        "return" | "return_transporting" | "return_sorting" | "returning" | "return_fail"
        | "returned" => CarrierStatus::Returned,
        _ => return None,
    };
    Some(status)
}

/// Shop credentials for the carrier API.
#[derive(Debug, Clone)]
pub struct CarrierConfig {
    token: SecretString,
    shop_id: String,
    base_url: String,
    timeout: Duration,
}

impl CarrierConfig {
    pub fn new(token: SecretString, shop_id: impl Into<String>) -> Self {
        Self {
            token,
            shop_id: shop_id.into(),
            base_url: SANDBOX_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn live(mut self, live: bool) -> Self {
        self.base_url = if live { LIVE_BASE_URL } else { SANDBOX_BASE_URL }.to_string();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct HttpCarrierClient {
    config: CarrierConfig,
    http: reqwest::Client,
}

impl HttpCarrierClient {
    pub fn new(config: CarrierConfig) -> Result<Self, ShippingError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ShippingError::Configuration(e.to_string()))?;
        Ok(Self { config, http })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Envelope<T>, ShippingError> {
        let response = self
            .http
            .post(format!("{}{API_PREFIX}{path}", self.config.base_url))
            .header("Token", self.config.token.expose_secret())
            .header("ShopId", &self.config.shop_id)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ShippingError::Unavailable(format!("HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| ShippingError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ShippingCarrier for HttpCarrierClient {
    async fn create_order(&self, request: &ShipmentRequest) -> Result<CarrierShipment, ShippingError> {
        let body = CreateOrderBody::from(request);
        let envelope: Envelope<CreatedOrder> =
            self.post("/shipping-order/create", &body).await?;
        let created = envelope.into_data()?;

        Ok(CarrierShipment {
            shipment_code: created.order_code,
            client_order_code: request.client_order_code.clone(),
            status: CarrierStatus::ReadyToPick,
            created_at: Utc::now(),
        })
    }

    async fn find_by_client_code(
        &self,
        client_order_code: &str,
    ) -> Result<Option<CarrierShipment>, ShippingError> {
        let envelope: Envelope<OrderDetail> = self
            .post(
                "/shipping-order/detail-by-client-code",
                &ClientCodeBody { client_order_code },
            )
            .await?;
        match envelope.into_data() {
            Ok(detail) => detail.into_shipment().map(Some),
            Err(ShippingError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn detail(&self, shipment_code: &str) -> Result<CarrierShipment, ShippingError> {
        let envelope: Envelope<OrderDetail> = self
            .post(
                "/shipping-order/detail",
                &OrderCodeBody {
                    order_code: shipment_code,
                },
            )
            .await?;
        envelope
            .into_data()
            .map_err(|err| match err {
                ShippingError::NotFound(_) => ShippingError::NotFound(shipment_code.to_string()),
                other => other,
            })?
            .into_shipment()
    }

    async fn cancel(&self, shipment_code: &str) -> Result<(), ShippingError> {
        let envelope: Envelope<Vec<CancelResult>> = self
            .post(
                "/switch-status/cancel",
                &CancelBody {
                    order_codes: vec![shipment_code],
                },
            )
            .await?;
        let results = envelope.into_data()?;
        let result = results
            .into_iter()
            .find(|r| r.order_code == shipment_code)
            .ok_or_else(|| ShippingError::NotFound(shipment_code.to_string()))?;
        if result.result {
            return Ok(());
        }

        // The carrier only says no; its detail tells us whether the parcel moved.
        let shipment = self.detail(shipment_code).await?;
        if shipment.status.is_picked_up() {
            Err(ShippingError::AlreadyPickedUp(shipment_code.to_string()))
        } else if shipment.status == CarrierStatus::Cancelled {
            Ok(())
        } else {
            Err(ShippingError::Rejected(result.message))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ShippingError> {
        if self.code != 200 {
            let lowered = self.message.to_ascii_lowercase();
            if self.code == 404 || lowered.contains("not found") || lowered.contains("không tìm thấy") {
                return Err(ShippingError::NotFound(self.message));
            }
            return Err(ShippingError::Rejected(format!("{}: {}", self.code, self.message)));
        }
        self.data
            .ok_or_else(|| ShippingError::InvalidResponse("response has no data".into()))
    }
}

#[derive(Serialize)]
struct CreateOrderBody {
    payment_type_id: u8,
    required_note: &'static str,
    client_order_code: String,
    to_name: String,
    to_phone: String,
    to_address: String,
    to_ward_name: String,
    to_district_name: String,
    to_province_name: String,
    cod_amount: i64,
    weight: u32,
    length: u32,
    width: u32,
    height: u32,
    service_type_id: u8,
    note: Option<String>,
    items: Vec<CreateOrderItem>,
}

#[derive(Serialize)]
struct CreateOrderItem {
    name: String,
    code: String,
    quantity: u32,
    weight: u32,
}

impl From<&ShipmentRequest> for CreateOrderBody {
    fn from(request: &ShipmentRequest) -> Self {
        let to = &request.recipient;
        Self {
            // Shop pays the shipping fee.
            payment_type_id: 1,
            required_note: "KHONGCHOXEMHANG",
            client_order_code: request.client_order_code.clone(),
            to_name: to.recipient_name.clone(),
            to_phone: to.phone.clone(),
            to_address: to.street.clone(),
            to_ward_name: to.ward.clone(),
            to_district_name: to.district.clone(),
            to_province_name: to.province.clone(),
            cod_amount: request.cod_amount.amount_minor(),
            weight: request.parcel.weight_grams,
            length: request.parcel.length_cm,
            width: request.parcel.width_cm,
            height: request.parcel.height_cm,
            service_type_id: 2,
            note: to.note.clone(),
            items: request
                .items
                .iter()
                .map(|item| CreateOrderItem {
                    name: item.name.clone(),
                    code: item.code.clone(),
                    quantity: item.quantity,
                    weight: item.weight_grams,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    order_code: String,
}

#[derive(Debug, Deserialize)]
struct OrderDetail {
    order_code: String,
    #[serde(default)]
    client_order_code: String,
    status: String,
    #[serde(default)]
    created_date: Option<chrono::DateTime<Utc>>,
}

impl OrderDetail {
    fn into_shipment(self) -> Result<CarrierShipment, ShippingError> {
        let status = carrier_status_from(&self.status).ok_or_else(|| {
            ShippingError::InvalidResponse(format!("unknown carrier status '{}'", self.status))
        })?;
        Ok(CarrierShipment {
            shipment_code: self.order_code,
            client_order_code: self.client_order_code,
            status,
            created_at: self.created_date.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Serialize)]
struct ClientCodeBody<'a> {
    client_order_code: &'a str,
}

#[derive(Serialize)]
struct OrderCodeBody<'a> {
    order_code: &'a str,
}

#[derive(Serialize)]
struct CancelBody<'a> {
    order_codes: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CancelResult {
    order_code: String,
    result: bool,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pickup_statuses_count_as_picked_up() {
        for status in ["picked", "transporting", "delivering", "delivered", "returned"] {
            assert!(
                carrier_status_from(status).unwrap().is_picked_up(),
                "{status} should count as picked up"
            );
        }
        for status in ["ready_to_pick", "picking", "cancel"] {
            assert!(!carrier_status_from(status).unwrap().is_picked_up());
        }
        assert_eq!(carrier_status_from("teleported"), None);
    }

    #[test]
    fn envelope_errors_are_classified() {
        let envelope: Envelope<CreatedOrder> = serde_json::from_value(serde_json::json!({
            "code": 400,
            "message": "Order not found",
            "data": null
        }))
        .unwrap();
        assert!(matches!(envelope.into_data(), Err(ShippingError::NotFound(_))));

        let envelope: Envelope<CreatedOrder> = serde_json::from_value(serde_json::json!({
            "code": 400,
            "message": "Số điện thoại không hợp lệ",
            "data": null
        }))
        .unwrap();
        assert!(matches!(envelope.into_data(), Err(ShippingError::Rejected(_))));
    }

    #[test]
    fn detail_maps_status() {
        let detail: OrderDetail = serde_json::from_value(serde_json::json!({
            "order_code": "LB6UKK",
            "client_order_code": "abc",
            "status": "picked"
        }))
        .unwrap();
        let shipment = detail.into_shipment().unwrap();
        assert_eq!(shipment.status, CarrierStatus::PickedUp);
        assert_eq!(shipment.shipment_code, "LB6UKK");
    }
}
