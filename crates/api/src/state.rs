//! Shared application state and its wiring from [`Config`].

use std::sync::Arc;

use domain::{Currency, OrderService};
use event_store::{EventStore, EventStoreError, ReceiptStore};
use gateways::{
    CallbackCodec, CarrierConfig, CashOnDelivery, GatewayError, GatewayRegistry,
    HttpCarrierClient, InMemoryCarrier, InMemoryRedirectCapture, InMemorySignedCallback,
    MomoClient, MomoConfig, PayPalClient, PayPalConfig, PaymentGateway, RedirectCapture,
    RetryPolicy, ShippingCarrier, ShippingDispatchAdapter, ShippingError, SignedCallback,
};
use orchestrator::{
    CheckoutService, InMemoryStorefront, OrderStateMachine, ReconciliationPoller, Storefront,
    WebhookIngestor,
};
use secrecy::SecretString;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("Payment gateway setup failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Carrier setup failed: {0}")]
    Shipping(#[from] ShippingError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] EventStoreError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outside collaborators of the orchestrator.
#[derive(Clone)]
pub struct Providers {
    pub gateways: GatewayRegistry,
    pub carrier: Arc<dyn ShippingCarrier>,
    pub storefront: Arc<dyn Storefront>,
}

impl Providers {
    /// Real clients where credentials are configured, sandboxes elsewhere.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let policy = RetryPolicy::default().with_call_timeout(config.provider_timeout);
        let live = config.payment_env.is_live();

        let redirect_api: Arc<dyn gateways::RedirectCaptureApi> = match &config.redirect_capture {
            Some(settings) => {
                let mut paypal = PayPalConfig::new(&settings.client_id, settings.client_secret.clone())
                    .live(live)
                    .with_return_urls(
                        config.public_url("/checkout/success"),
                        config.public_url("/checkout/cancel"),
                    )
                    .with_timeout(config.provider_timeout);
                if let Some(url) = &settings.base_url {
                    paypal = paypal.with_base_url(url);
                }
                Arc::new(PayPalClient::new(paypal)?)
            }
            None => {
                tracing::warn!("redirect-capture credentials not set; using the in-process sandbox");
                Arc::new(InMemoryRedirectCapture::new())
            }
        };

        let signed = match &config.signed_callback {
            Some(settings) => {
                let mut momo = MomoConfig::new(
                    &settings.partner_code,
                    &settings.access_key,
                    settings.secret_key.clone(),
                )
                .live(live)
                .with_urls(
                    config.public_url("/checkout/success"),
                    config.public_url("/payments/signed_callback/callback"),
                )
                .with_timeout(config.provider_timeout);
                if let Some(url) = &settings.base_url {
                    momo = momo.with_base_url(url);
                }
                let codec = momo.codec();
                SignedCallback::new(Arc::new(MomoClient::new(momo)?), codec)
            }
            None => {
                tracing::warn!("signed-callback credentials not set; using the in-process sandbox");
                let codec = sandbox_codec();
                SignedCallback::new(Arc::new(InMemorySignedCallback::new(codec.clone())), codec)
            }
        };

        let carrier: Arc<dyn ShippingCarrier> = match &config.carrier {
            Some(settings) => {
                let mut carrier = CarrierConfig::new(settings.token.clone(), &settings.shop_id)
                    .live(live)
                    .with_timeout(config.provider_timeout);
                if let Some(url) = &settings.base_url {
                    carrier = carrier.with_base_url(url);
                }
                Arc::new(HttpCarrierClient::new(carrier)?)
            }
            None => {
                tracing::warn!("carrier credentials not set; using the in-process sandbox");
                Arc::new(InMemoryCarrier::new())
            }
        };

        let gateways = GatewayRegistry::new()
            .with(PaymentGateway::CashOnDelivery(CashOnDelivery::new()))
            .with(PaymentGateway::RedirectCapture(
                RedirectCapture::new(redirect_api, config.redirect_capture_currency)
                    .with_policy(policy),
            ))
            .with(PaymentGateway::SignedCallback(signed.with_policy(policy)));

        Ok(Self {
            gateways,
            carrier,
            storefront: Arc::new(InMemoryStorefront::new()),
        })
    }
}

/// Sandbox codec with a per-process secret: nothing outside this process
/// can forge one of its callbacks.
fn sandbox_codec() -> CallbackCodec {
    CallbackCodec::new(
        "SANDBOX",
        "sandbox-access-key",
        SecretString::new(uuid::Uuid::new_v4().simple().to_string()),
    )
    .with_currency(Currency::Vnd)
}

/// Shared application state accessible from all handlers.
pub struct AppState<S: EventStore> {
    pub machine: Arc<OrderStateMachine<S>>,
    pub checkout: CheckoutService<S>,
    pub webhooks: WebhookIngestor<S>,
    pub poller: Arc<ReconciliationPoller<S>>,
}

impl<S: EventStore> AppState<S> {
    /// Wires every service around one order state machine.
    pub fn new(
        store: S,
        receipts: Arc<dyn ReceiptStore>,
        providers: Providers,
        config: &Config,
    ) -> Self {
        let orders = OrderService::new(store).with_policy(config.amount_policy());
        let shipping = ShippingDispatchAdapter::new(providers.carrier).with_policy(
            RetryPolicy::default().with_call_timeout(config.provider_timeout),
        );
        let machine = Arc::new(OrderStateMachine::new(
            Arc::new(orders),
            shipping,
            providers.storefront,
        ));

        Self {
            checkout: CheckoutService::new(machine.clone(), providers.gateways.clone()),
            webhooks: WebhookIngestor::new(
                machine.clone(),
                providers.gateways.clone(),
                receipts.clone(),
            ),
            poller: Arc::new(
                ReconciliationPoller::new(machine.clone(), providers.gateways, receipts)
                    .with_config(config.poller),
            ),
            machine,
        }
    }
}
