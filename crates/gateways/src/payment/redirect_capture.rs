//! Redirect-and-capture rail (PayPal Orders v2 shape).
//!
//! The payer approves on the provider's page and comes back; we then
//! capture synchronously. No webhook is involved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use domain::{Currency, Money};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{ConfirmationResult, CreatedIntent, IntentRef, IntentRequest, ProviderStatus};
use crate::error::GatewayError;
use crate::retry::RetryPolicy;

pub const SANDBOX_BASE_URL: &str = "https://api-m.sandbox.paypal.com";
pub const LIVE_BASE_URL: &str = "https://api-m.paypal.com";

/// Transport for the redirect-capture rail.
#[async_trait]
pub trait RedirectCaptureApi: Send + Sync {
    /// Registers the order at the provider and returns the approval link.
    async fn create_order(&self, request: &IntentRequest) -> Result<CreatedIntent, GatewayError>;

    /// Captures an approved order.
    async fn capture(&self, provider_reference: &str) -> Result<ConfirmationResult, GatewayError>;

    async fn get_order(&self, provider_reference: &str) -> Result<ProviderStatus, GatewayError>;
}

/// The redirect-capture variant of [`super::PaymentGateway`].
#[derive(Clone)]
pub struct RedirectCapture {
    api: Arc<dyn RedirectCaptureApi>,
    currency: Currency,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RedirectCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectCapture")
            .field("currency", &self.currency)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RedirectCapture {
    pub fn new(api: Arc<dyn RedirectCaptureApi>, currency: Currency) -> Self {
        Self {
            api,
            currency,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub(crate) async fn create_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<CreatedIntent, GatewayError> {
        self.policy.timed(self.api.create_order(request)).await
    }

    pub(crate) async fn capture(
        &self,
        intent: &IntentRef,
    ) -> Result<ConfirmationResult, GatewayError> {
        let reference = intent.reference()?;
        self.policy.timed(self.api.capture(reference)).await
    }

    pub(crate) async fn query_status(
        &self,
        intent: &IntentRef,
    ) -> Result<ProviderStatus, GatewayError> {
        let reference = intent.reference()?;
        self.policy.timed(self.api.get_order(reference)).await
    }
}

/// Credentials and URLs for the PayPal client.
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    client_id: String,
    client_secret: SecretString,
    base_url: String,
    return_url: String,
    cancel_url: String,
    timeout: Duration,
}

impl PayPalConfig {
    pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            base_url: SANDBOX_BASE_URL.to_string(),
            return_url: String::new(),
            cancel_url: String::new(),
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

    /// Where the payer lands after approving or cancelling.
    pub fn with_return_urls(mut self, return_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        self.return_url = return_url.into();
        self.cancel_url = cancel_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// HTTP client for the PayPal Orders v2 API.
pub struct PayPalClient {
    config: PayPalConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalClient {
    pub fn new(config: PayPalConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    /// Client-credentials token, cached until shortly before expiry.
    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.base_url))
            .basic_auth(
                &self.config.client_id,
                Some(self.config.client_secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = read_json(response).await?;

        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl RedirectCaptureApi for PayPalClient {
    async fn create_order(&self, request: &IntentRequest) -> Result<CreatedIntent, GatewayError> {
        let token = self.access_token().await?;
        let body = CreateOrderBody {
            intent: "CAPTURE",
            purchase_units: vec![PurchaseUnitRequest {
                reference_id: request.order_id.to_string(),
                custom_id: request.intent_id.to_string(),
                description: request.description.clone(),
                amount: WireAmount::from(request.amount),
            }],
            application_context: ApplicationContext {
                return_url: self.config.return_url.clone(),
                cancel_url: self.config.cancel_url.clone(),
                user_action: "PAY_NOW",
            },
        };

        let response = self
            .http
            .post(format!("{}/v2/checkout/orders", self.config.base_url))
            .bearer_auth(token)
            .header("PayPal-Request-Id", &request.idempotency_key)
            .json(&body)
            .send()
            .await?;
        let order: OrderResponse = read_json(response).await?;

        let approval_url = order
            .links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href.clone());
        if approval_url.is_none() {
            return Err(GatewayError::InvalidResponse(format!(
                "order {} has no approval link",
                order.id
            )));
        }

        Ok(CreatedIntent {
            provider_reference: Some(order.id),
            approval_url,
            amount: request.amount,
        })
    }

    async fn capture(&self, provider_reference: &str) -> Result<ConfirmationResult, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v2/checkout/orders/{provider_reference}/capture",
                self.config.base_url
            ))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("capture-{provider_reference}"))
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let error: ErrorResponse = read_error(response).await;
            return match error.issue() {
                Some("ORDER_ALREADY_CAPTURED") => {
                    Ok(self.get_order(provider_reference).await?.into())
                }
                Some(issue) => Ok(ConfirmationResult::Declined {
                    reason: issue.to_string(),
                }),
                None => Err(GatewayError::Rejected(error.name)),
            };
        }

        let order: OrderResponse = read_json(response).await?;
        Ok(order.status()?.into())
    }

    async fn get_order(&self, provider_reference: &str) -> Result<ProviderStatus, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!(
                "{}/v2/checkout/orders/{provider_reference}",
                self.config.base_url
            ))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::UnknownReference(provider_reference.to_string()));
        }
        let order: OrderResponse = read_json(response).await?;
        order.status()
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, GatewayError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(GatewayError::Unavailable(format!("HTTP {status}")));
    }
    if !status.is_success() {
        let error = read_error(response).await;
        return Err(GatewayError::Rejected(format!(
            "HTTP {status}: {}",
            error.issue().unwrap_or(error.name.as_str())
        )));
    }
    response
        .json()
        .await
        .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}

async fn read_error(response: reqwest::Response) -> ErrorResponse {
    response.json().await.unwrap_or_default()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Serialize)]
struct CreateOrderBody {
    intent: &'static str,
    purchase_units: Vec<PurchaseUnitRequest>,
    application_context: ApplicationContext,
}

#[derive(Serialize)]
struct PurchaseUnitRequest {
    reference_id: String,
    custom_id: String,
    description: String,
    amount: WireAmount,
}

#[derive(Serialize)]
struct ApplicationContext {
    return_url: String,
    cancel_url: String,
    user_action: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireAmount {
    currency_code: String,
    value: String,
}

impl From<Money> for WireAmount {
    fn from(money: Money) -> Self {
        Self {
            currency_code: money.currency().code().to_string(),
            value: money.to_decimal_string(),
        }
    }
}

impl WireAmount {
    fn to_money(&self) -> Result<Money, GatewayError> {
        let currency: Currency = self
            .currency_code
            .parse()
            .map_err(|e: domain::MoneyError| GatewayError::InvalidResponse(e.to_string()))?;
        Money::from_decimal_str(&self.value, currency)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnitResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct PurchaseUnitResponse {
    #[serde(default)]
    payments: Option<Payments>,
}

#[derive(Debug, Default, Deserialize)]
struct Payments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
    amount: WireAmount,
}

impl OrderResponse {
    fn capture(&self) -> Option<&Capture> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next()
    }

    fn status(&self) -> Result<ProviderStatus, GatewayError> {
        match self.status.as_str() {
            "COMPLETED" => {
                let capture = self.capture().ok_or_else(|| {
                    GatewayError::InvalidResponse(format!("order {} has no capture", self.id))
                })?;
                match capture.status.as_str() {
                    "COMPLETED" => Ok(ProviderStatus::Paid {
                        transaction_id: capture.id.clone(),
                        amount: capture.amount.to_money()?,
                    }),
                    "PENDING" => Ok(ProviderStatus::Pending),
                    other => Ok(ProviderStatus::Failed {
                        reason: format!("capture {other}"),
                    }),
                }
            }
            "VOIDED" => Ok(ProviderStatus::Failed {
                reason: "order voided".to_string(),
            }),
            _ => Ok(ProviderStatus::Pending),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    issue: String,
}

impl ErrorResponse {
    fn issue(&self) -> Option<&str> {
        self.details.first().map(|d| d.issue.as_str())
    }
}
