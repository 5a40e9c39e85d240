//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::{AppState, Config, Providers};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use domain::{CarrierStatus, Currency};
use event_store::InMemoryEventStore;
use gateways::{
    CallbackCodec, CashOnDelivery, GatewayRegistry, InMemoryCarrier, InMemoryRedirectCapture,
    InMemorySignedCallback, PaymentGateway, RedirectCapture, RetryPolicy, SignedCallback,
};
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::InMemoryStorefront;
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: Router,
    #[allow(dead_code)]
    state: Arc<AppState<InMemoryEventStore>>,
    momo: InMemorySignedCallback,
    paypal: InMemoryRedirectCapture,
    carrier: InMemoryCarrier,
}

fn setup() -> TestApp {
    let codec = CallbackCodec::new(
        "MOMOTEST",
        "access-key",
        SecretString::new("callback-secret".into()),
    );
    let momo = InMemorySignedCallback::new(codec.clone());
    let paypal = InMemoryRedirectCapture::new();
    let carrier = InMemoryCarrier::new();
    let policy = RetryPolicy::default().immediate();

    let gateways = GatewayRegistry::new()
        .with(PaymentGateway::CashOnDelivery(CashOnDelivery::new()))
        .with(PaymentGateway::RedirectCapture(
            RedirectCapture::new(Arc::new(paypal.clone()), Currency::Vnd).with_policy(policy),
        ))
        .with(PaymentGateway::SignedCallback(
            SignedCallback::new(Arc::new(momo.clone()), codec).with_policy(policy),
        ));
    let providers = Providers {
        gateways,
        carrier: Arc::new(carrier.clone()),
        storefront: Arc::new(InMemoryStorefront::new()),
    };

    let state = api::create_memory_state(&Config::default(), providers);
    let app = api::create_app(state.clone(), get_metrics_handle());
    TestApp {
        app,
        state,
        momo,
        paypal,
        carrier,
    }
}

fn placement(method: &str) -> Value {
    json!({
        "items": [{
            "product_id": "SKU-1",
            "name": "Ceramic mug",
            "quantity": 1,
            "unit_price_minor": 170500
        }],
        "currency": "VND",
        "shipping_address": {
            "recipient_name": "Tran B",
            "phone": "0901234567",
            "street": "1 Nguyen Hue",
            "ward": "Ben Nghe",
            "district": "District 1",
            "province": "Ho Chi Minh"
        },
        "payment_method": method
    })
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn post_raw(&self, uri: &str, body: Vec<u8>) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    /// Places an order and returns its id and the first provider reference.
    async fn place(&self, method: &str) -> (String, Option<String>) {
        let (status, json) = self.post("/orders", placement(method)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        let id = json["order"]["id"].as_str().unwrap().to_string();
        let reference = json["payment"]["provider_reference"]
            .as_str()
            .map(String::from);
        (id, reference)
    }
}

#[tokio::test]
async fn test_health_check() {
    let t = setup();
    let (status, json) = t.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(
        json["providers"],
        json!(["cod", "redirect_capture", "signed_callback"])
    );
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = setup();
    t.place("cod").await;

    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("orders_placed_total"));
}

#[tokio::test]
async fn test_cod_order_ships_at_placement() {
    let t = setup();
    let (status, json) = t.post("/orders", placement("cod")).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["order"]["status"], "PROCESSING");
    assert_eq!(json["order"]["payment_status"], "PENDING");
    assert_eq!(json["order"]["total"]["amount_minor"], 170500);
    assert_eq!(json["order"]["shipment"]["cod_amount"]["amount_minor"], 170500);
    assert!(json["payment"].is_null());
    assert_eq!(t.carrier.create_calls(), 1);
}

#[tokio::test]
async fn test_invalid_order_is_rejected() {
    let t = setup();
    let mut body = placement("cod");
    body["items"] = json!([]);

    let (status, json) = t.post("/orders", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["retryable"], false);
}

#[tokio::test]
async fn test_get_order_errors() {
    let t = setup();

    let (status, _) = t.get("/orders/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = t
        .get("/orders/00000000-0000-0000-0000-000000000001")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["retryable"], false);
}

#[tokio::test]
async fn test_signed_callback_settles_once() {
    let t = setup();
    let (id, reference) = t.place("signed_callback").await;
    let body = t.momo.complete(&reference.unwrap(), 4_088_114_551).unwrap();

    let (status, json) = t
        .post_raw("/payments/signed_callback/callback", body.clone())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rsp_code"], "00");

    let (status, json) = t.post_raw("/payments/signed_callback/callback", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rsp_code"], "02");

    let (_, order) = t.get(&format!("/orders/{id}")).await;
    assert_eq!(order["payment_status"], "PAID");
    assert_eq!(order["transaction_id"], "4088114551");
    assert_eq!(order["status"], "PROCESSING");
    assert_eq!(t.carrier.create_calls(), 1);
}

#[tokio::test]
async fn test_forged_callback_is_refused() {
    let t = setup();
    let (id, reference) = t.place("signed_callback").await;
    let body = t.momo.complete(&reference.unwrap(), 1).unwrap();
    let forged = String::from_utf8(body)
        .unwrap()
        .replace("\"amount\":170500", "\"amount\":1");

    let (status, json) = t
        .post_raw("/payments/signed_callback/callback", forged.into_bytes())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["rsp_code"], "97");

    let (_, order) = t.get(&format!("/orders/{id}")).await;
    assert_eq!(order["payment_status"], "PENDING");
}

#[tokio::test]
async fn test_malformed_callbacks() {
    let t = setup();

    let (status, json) = t
        .post_raw("/payments/signed_callback/callback", b"{not json".to_vec())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["rsp_code"], "99");

    let (status, json) = t
        .post_raw("/payments/carrier_pigeon/callback", b"{}".to_vec())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["rsp_code"], "99");
}

#[tokio::test]
async fn test_redirect_capture_flow() {
    let t = setup();
    let (id, reference) = t.place("redirect_capture").await;
    let reference = reference.unwrap();

    let capture = json!({ "order_id": id, "provider_reference": reference });
    let (status, json) = t.post("/payments/redirect_capture/capture", capture.clone()).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["capture"], "captured");
    assert_eq!(json["payment_status"], "PAID");

    let (status, json) = t.post("/payments/redirect_capture/capture", capture).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["capture"], "already_paid");
    assert_eq!(t.paypal.captured_count(), 1);
}

#[tokio::test]
async fn test_declined_capture() {
    let t = setup();
    let (id, _) = t.place("redirect_capture").await;
    t.paypal.set_decline_captures(true);

    let (status, json) = t
        .post("/payments/redirect_capture/capture", json!({ "order_id": id }))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(json["capture"], "declined");
    assert_eq!(json["order_status"], "PAYMENT_FAILED");
}

#[tokio::test]
async fn test_capture_is_only_for_redirect_capture() {
    let t = setup();
    let (id, _) = t.place("signed_callback").await;

    let (status, _) = t
        .post("/payments/signed_callback/capture", json!({ "order_id": id }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_order_returns_live_intent() {
    let t = setup();
    let (id, reference) = t.place("signed_callback").await;

    let (status, json) = t
        .post(
            "/payments/signed_callback/create-order",
            json!({ "order_id": id }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["intent"]["provider_reference"], json!(reference));
    assert_eq!(t.momo.create_calls(), 1);
}

#[tokio::test]
async fn test_provider_outage_is_retryable() {
    let t = setup();
    t.momo.set_unavailable(true);
    let (status, json) = t.post("/orders", placement("signed_callback")).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["order"]["status"], "PENDING_PAYMENT");
    assert!(json["payment_error"].is_string());

    let id = json["order"]["id"].as_str().unwrap();
    let (status, json) = t
        .post(
            "/payments/signed_callback/create-order",
            json!({ "order_id": id }),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["retryable"], true);
}

#[tokio::test]
async fn test_status_refresh_reconciles_missed_callback() {
    let t = setup();
    let (id, reference) = t.place("signed_callback").await;
    t.momo.complete(&reference.unwrap(), 77).unwrap();

    let (_, json) = t
        .get(&format!("/payments/signed_callback/status/{id}"))
        .await;
    assert_eq!(json["payment_status"], "PENDING");
    assert!(json["shipment_code"].is_null());
    assert_eq!(json["shipment_pending"], false);

    let (status, json) = t
        .get(&format!("/payments/signed_callback/status/{id}?refresh=true"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["payment_status"], "PAID");
    assert_eq!(json["intent"]["status"], "CONFIRMED");
    assert!(json["shipment_code"].as_str().is_some_and(|c| !c.is_empty()));
    assert_eq!(json["shipment_pending"], false);
    assert_eq!(t.carrier.create_calls(), 1);

    let (status, _) = t.get(&format!("/payments/cod/status/{id}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_after_cancel_is_flagged() {
    let t = setup();
    let (id, reference) = t.place("signed_callback").await;

    let (status, json) = t
        .post(
            &format!("/admin/orders/{id}/cancel"),
            json!({ "actor": "ops", "reason": "customer request" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["order"]["status"], "CANCELLED");

    let body = t.momo.complete(&reference.unwrap(), 55).unwrap();
    let (status, json) = t.post_raw("/payments/signed_callback/callback", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rsp_code"], "00");

    let (_, order) = t.get(&format!("/orders/{id}")).await;
    assert_eq!(order["status"], "CANCELLED");
    assert_eq!(order["flags"][0]["kind"], "PAYMENT_AFTER_CANCELLATION");
}

#[tokio::test]
async fn test_cancel_after_pickup_conflicts() {
    let t = setup();
    let (id, _) = t.place("cod").await;
    let (_, order) = t.get(&format!("/orders/{id}")).await;
    let code = order["shipment"]["shipment_code"].as_str().unwrap();
    t.carrier.set_status(code, CarrierStatus::PickedUp);

    let (status, json) = t
        .post(&format!("/admin/orders/{id}/cancel"), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["retryable"], false);
}

#[tokio::test]
async fn test_admin_status_override() {
    let t = setup();
    let (id, _) = t.place("cod").await;

    let (status, json) = t
        .post(
            &format!("/admin/orders/{id}/status"),
            json!({ "status": "SHIPPING", "actor": "ops" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["changed"], true);
    assert_eq!(json["order"]["status"], "SHIPPING");

    let (status, _) = t
        .post(
            &format!("/admin/orders/{id}/status"),
            json!({ "status": "PAYMENT_CONFIRMED" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = t
        .post(
            &format!("/admin/orders/{id}/status"),
            json!({ "status": "LOST" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_records_cod_collection() {
    let t = setup();
    let (id, _) = t.place("cod").await;

    let (status, json) = t
        .post(
            &format!("/admin/orders/{id}/payment"),
            json!({ "transaction_id": "COD-CASH-1" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["order"]["payment_status"], "PAID");
    assert_eq!(json["order"]["status"], "PROCESSING");
    assert_eq!(t.carrier.create_calls(), 1);
}

#[tokio::test]
async fn test_shipment_tracking_and_retry() {
    let t = setup();
    let (id, _) = t.place("cod").await;
    let (_, order) = t.get(&format!("/orders/{id}")).await;
    let code = order["shipment"]["shipment_code"].as_str().unwrap();

    let (status, _) = t
        .post(&format!("/admin/orders/{id}/shipment/retry"), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    t.carrier.set_status(code, CarrierStatus::Delivered);
    let (status, json) = t
        .post(&format!("/admin/orders/{id}/shipment/track"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["shipment"]["carrier_status"], "DELIVERED");
    assert_eq!(json["status"], "COMPLETED");
}

#[tokio::test]
async fn test_on_demand_sweep() {
    let t = setup();
    t.place("signed_callback").await;

    let (status, json) = t.post("/admin/reconciliation/sweep", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["examined"], 1);
    assert_eq!(json["errors"], 0);
}
