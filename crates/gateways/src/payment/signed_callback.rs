//! Redirect plus signed callback rail (MoMo-style IPN).
//!
//! The payer is redirected to the provider. Completion arrives only as an
//! HMAC-signed callback; the status query is a fallback for the
//! reconciliation poller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use domain::{Currency, Money};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CallbackNotice, CreatedIntent, IntentRef, IntentRequest, ProviderStatus};
use crate::error::{CallbackError, GatewayError};
use crate::retry::RetryPolicy;
use crate::signature::SignatureVerifier;

pub const SANDBOX_BASE_URL: &str = "https://test-payment.momo.vn";
pub const LIVE_BASE_URL: &str = "https://payment.momo.vn";

const ORDER_NOT_FOUND: i32 = 42;

/// Transport for the signed-callback rail.
#[async_trait]
pub trait SignedCallbackApi: Send + Sync {
    /// Registers the payment and returns the pay URL.
    async fn create_payment(&self, request: &IntentRequest) -> Result<CreatedIntent, GatewayError>;

    /// Asks the provider for the current state of a payment.
    async fn query(&self, provider_reference: &str) -> Result<ProviderStatus, GatewayError>;
}

/// Provider order id for an idempotency key: `{order_id}_{attempt}`.
///
/// The provider only accepts `[0-9a-zA-Z_.-]`, and every attempt needs its
/// own id.
pub fn provider_order_id(idempotency_key: &str) -> String {
    idempotency_key.replace(':', "_")
}

/// Recovers the order id from a provider order id.
pub fn order_id_from_reference(reference: &str) -> Option<AggregateId> {
    let order_part = reference
        .rsplit_once('_')
        .map_or(reference, |(order, _)| order);
    order_part.parse().ok()
}

/// Maps a provider result code onto a payment status.
pub fn status_for(result_code: i32, transaction_id: &str, amount: Money, message: &str) -> ProviderStatus {
    match result_code {
        0 | 9000 => ProviderStatus::Paid {
            transaction_id: transaction_id.to_string(),
            amount,
        },
        1000 | 7000 | 7002 => ProviderStatus::Pending,
        code => ProviderStatus::Failed {
            reason: format!("{code}: {message}"),
        },
    }
}

/// Body of an inbound payment callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub partner_code: String,
    pub order_id: String,
    pub request_id: String,
    pub amount: i64,
    #[serde(default)]
    pub order_info: String,
    #[serde(default)]
    pub order_type: String,
    pub trans_id: i64,
    pub result_code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pay_type: String,
    pub response_time: i64,
    #[serde(default)]
    pub extra_data: String,
    pub signature: String,
}

/// Signs and reads callbacks for one partner account.
#[derive(Debug, Clone)]
pub struct CallbackCodec {
    partner_code: String,
    access_key: String,
    verifier: SignatureVerifier,
    currency: Currency,
}

impl CallbackCodec {
    pub fn new(partner_code: impl Into<String>, access_key: impl Into<String>, secret: SecretString) -> Self {
        Self {
            partner_code: partner_code.into(),
            access_key: access_key.into(),
            verifier: SignatureVerifier::new(secret),
            currency: Currency::Vnd,
        }
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }

    pub fn partner_code(&self) -> &str {
        &self.partner_code
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub(crate) fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub(crate) fn access_key(&self) -> &str {
        &self.access_key
    }

    fn canonical_fields(&self, payload: &CallbackPayload) -> Vec<(&'static str, String)> {
        vec![
            ("accessKey", self.access_key.clone()),
            ("amount", payload.amount.to_string()),
            ("extraData", payload.extra_data.clone()),
            ("message", payload.message.clone()),
            ("orderId", payload.order_id.clone()),
            ("orderInfo", payload.order_info.clone()),
            ("orderType", payload.order_type.clone()),
            ("partnerCode", payload.partner_code.clone()),
            ("payType", payload.pay_type.clone()),
            ("requestId", payload.request_id.clone()),
            ("responseTime", payload.response_time.to_string()),
            ("resultCode", payload.result_code.to_string()),
            ("transId", payload.trans_id.to_string()),
        ]
    }

    /// Fills in the signature the way the provider does.
    pub fn sign(&self, payload: &mut CallbackPayload) {
        let fields = self.canonical_fields(payload);
        payload.signature = self.verifier.sign_fields(&borrowed(&fields));
    }

    pub fn verify(&self, payload: &CallbackPayload) -> bool {
        let fields = self.canonical_fields(payload);
        self.verifier
            .verify_fields(&borrowed(&fields), &payload.signature)
    }

    /// Parses a raw callback body. The signature is checked before any
    /// field is trusted.
    pub fn parse(&self, body: &[u8]) -> Result<CallbackNotice, CallbackError> {
        let payload: CallbackPayload = serde_json::from_slice(body)
            .map_err(|e| CallbackError::Malformed(e.to_string()))?;

        if !self.verify(&payload) {
            return Err(CallbackError::InvalidSignature);
        }
        if payload.partner_code != self.partner_code {
            return Err(CallbackError::Malformed(format!(
                "unexpected partner code '{}'",
                payload.partner_code
            )));
        }
        let order_id = order_id_from_reference(&payload.order_id).ok_or_else(|| {
            CallbackError::Malformed(format!("unrecognised order id '{}'", payload.order_id))
        })?;

        let transaction_id = payload.trans_id.to_string();
        let amount = Money::new(payload.amount, self.currency);
        Ok(CallbackNotice {
            order_id,
            status: status_for(payload.result_code, &transaction_id, amount, &payload.message),
            correlation_key: format!("{}:{}", payload.order_id, transaction_id),
            provider_reference: payload.order_id,
            transaction_id,
            amount,
        })
    }
}

fn borrowed<'a>(fields: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
    fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
}

/// The signed-callback variant of [`super::PaymentGateway`].
#[derive(Clone)]
pub struct SignedCallback {
    api: Arc<dyn SignedCallbackApi>,
    codec: CallbackCodec,
    policy: RetryPolicy,
}

impl std::fmt::Debug for SignedCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedCallback")
            .field("partner_code", &self.codec.partner_code)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SignedCallback {
    pub fn new(api: Arc<dyn SignedCallbackApi>, codec: CallbackCodec) -> Self {
        Self {
            api,
            codec,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn currency(&self) -> Currency {
        self.codec.currency()
    }

    pub(crate) async fn create_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<CreatedIntent, GatewayError> {
        self.policy.timed(self.api.create_payment(request)).await
    }

    pub(crate) async fn query_status(
        &self,
        intent: &IntentRef,
    ) -> Result<ProviderStatus, GatewayError> {
        let reference = intent.reference()?;
        self.policy.timed(self.api.query(reference)).await
    }

    pub(crate) fn parse_callback(&self, body: &[u8]) -> Result<CallbackNotice, CallbackError> {
        self.codec.parse(body)
    }
}

/// Partner account and URLs for the MoMo client.
#[derive(Debug, Clone)]
pub struct MomoConfig {
    partner_code: String,
    access_key: String,
    secret_key: SecretString,
    base_url: String,
    redirect_url: String,
    ipn_url: String,
    timeout: Duration,
}

impl MomoConfig {
    pub fn new(
        partner_code: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: SecretString,
    ) -> Self {
        Self {
            partner_code: partner_code.into(),
            access_key: access_key.into(),
            secret_key,
            base_url: SANDBOX_BASE_URL.to_string(),
            redirect_url: String::new(),
            ipn_url: String::new(),
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

    /// Payer return page and the public callback endpoint.
    pub fn with_urls(mut self, redirect_url: impl Into<String>, ipn_url: impl Into<String>) -> Self {
        self.redirect_url = redirect_url.into();
        self.ipn_url = ipn_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Codec for the callbacks this account receives.
    pub fn codec(&self) -> CallbackCodec {
        CallbackCodec::new(
            self.partner_code.clone(),
            self.access_key.clone(),
            self.secret_key.clone(),
        )
    }
}

/// HTTP client for the MoMo payment gateway.
pub struct MomoClient {
    config: MomoConfig,
    codec: CallbackCodec,
    http: reqwest::Client,
}

impl MomoClient {
    pub fn new(config: MomoConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let codec = config.codec();
        Ok(Self {
            config,
            codec,
            http,
        })
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .post(format!("{}{path}", self.config.base_url))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl SignedCallbackApi for MomoClient {
    async fn create_payment(&self, request: &IntentRequest) -> Result<CreatedIntent, GatewayError> {
        let order_id = provider_order_id(&request.idempotency_key);
        let request_id = request.intent_id.to_string();
        let amount = request.amount.amount_minor().to_string();
        let extra_data = String::new();
        let signature = self.codec.verifier().sign_fields(&[
            ("accessKey", self.codec.access_key()),
            ("amount", amount.as_str()),
            ("extraData", extra_data.as_str()),
            ("ipnUrl", self.config.ipn_url.as_str()),
            ("orderId", order_id.as_str()),
            ("orderInfo", request.description.as_str()),
            ("partnerCode", self.config.partner_code.as_str()),
            ("redirectUrl", self.config.redirect_url.as_str()),
            ("requestId", request_id.as_str()),
            ("requestType", "captureWallet"),
        ]);

        let body = CreateBody {
            partner_code: &self.config.partner_code,
            request_id: &request_id,
            amount: request.amount.amount_minor(),
            order_id: &order_id,
            order_info: &request.description,
            redirect_url: &self.config.redirect_url,
            ipn_url: &self.config.ipn_url,
            request_type: "captureWallet",
            extra_data: &extra_data,
            lang: "vi",
            signature,
        };
        let response: CreateResponse = self.post("/v2/gateway/api/create", &body).await?;
        if response.result_code != 0 {
            return Err(GatewayError::Rejected(format!(
                "{}: {}",
                response.result_code, response.message
            )));
        }
        let pay_url = response
            .pay_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GatewayError::InvalidResponse("missing payUrl".to_string()))?;

        Ok(CreatedIntent {
            provider_reference: Some(order_id),
            approval_url: Some(pay_url),
            amount: request.amount,
        })
    }

    async fn query(&self, provider_reference: &str) -> Result<ProviderStatus, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let signature = self.codec.verifier().sign_fields(&[
            ("accessKey", self.codec.access_key()),
            ("orderId", provider_reference),
            ("partnerCode", self.config.partner_code.as_str()),
            ("requestId", request_id.as_str()),
        ]);
        let body = QueryBody {
            partner_code: &self.config.partner_code,
            request_id: &request_id,
            order_id: provider_reference,
            lang: "vi",
            signature,
        };

        let response: QueryResponse = self.post("/v2/gateway/api/query", &body).await?;
        if response.result_code == ORDER_NOT_FOUND {
            return Err(GatewayError::UnknownReference(provider_reference.to_string()));
        }
        let transaction_id = response.trans_id.map(|t| t.to_string()).unwrap_or_default();
        Ok(status_for(
            response.result_code,
            &transaction_id,
            Money::new(response.amount.unwrap_or_default(), self.codec.currency()),
            &response.message,
        ))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    partner_code: &'a str,
    request_id: &'a str,
    amount: i64,
    order_id: &'a str,
    order_info: &'a str,
    redirect_url: &'a str,
    ipn_url: &'a str,
    request_type: &'a str,
    extra_data: &'a str,
    lang: &'a str,
    signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    result_code: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    pay_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    partner_code: &'a str,
    request_id: &'a str,
    order_id: &'a str,
    lang: &'a str,
    signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    result_code: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    trans_id: Option<i64>,
    #[serde(default)]
    amount: Option<i64>,
}
