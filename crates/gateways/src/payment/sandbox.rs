//! In-memory provider sandboxes for tests and credential-less runs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use domain::Money;

use super::redirect_capture::RedirectCaptureApi;
use super::signed_callback::{
    CallbackCodec, CallbackPayload, SignedCallbackApi, provider_order_id, status_for,
};
use super::{ConfirmationResult, CreatedIntent, IntentRequest, ProviderStatus};
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxOrderStatus {
    Created,
    Captured,
    Declined,
}

#[derive(Debug, Clone)]
struct SandboxOrder {
    amount: Money,
    status: SandboxOrderStatus,
    capture_id: Option<String>,
}

#[derive(Debug, Default)]
struct RedirectCaptureState {
    orders: HashMap<String, SandboxOrder>,
    by_request_id: HashMap<String, String>,
    next_id: u32,
    create_calls: usize,
    capture_calls: usize,
    get_calls: usize,
    unavailable: bool,
    decline_captures: bool,
    capture_times_out: bool,
    captured_amount: Option<Money>,
}

/// Redirect-capture sandbox. Orders are approved as soon as they exist.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRedirectCapture {
    state: Arc<RwLock<RedirectCaptureState>>,
}

impl InMemoryRedirectCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails as if the provider were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.write().unavailable = unavailable;
    }

    pub fn set_decline_captures(&self, decline: bool) {
        self.write().decline_captures = decline;
    }

    /// Captures still happen, but the caller sees a timeout.
    pub fn set_capture_times_out(&self, times_out: bool) {
        self.write().capture_times_out = times_out;
    }

    /// Reports this amount as captured instead of the order amount.
    pub fn set_captured_amount(&self, amount: Option<Money>) {
        self.write().captured_amount = amount;
    }

    pub fn create_calls(&self) -> usize {
        self.read().create_calls
    }

    pub fn capture_calls(&self) -> usize {
        self.read().capture_calls
    }

    pub fn get_calls(&self) -> usize {
        self.read().get_calls
    }

    /// Number of orders that reached the captured state.
    pub fn captured_count(&self) -> usize {
        self.read()
            .orders
            .values()
            .filter(|o| o.status == SandboxOrderStatus::Captured)
            .count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RedirectCaptureState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RedirectCaptureState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RedirectCaptureApi for InMemoryRedirectCapture {
    async fn create_order(&self, request: &IntentRequest) -> Result<CreatedIntent, GatewayError> {
        let mut state = self.write();
        state.create_calls += 1;
        if state.unavailable {
            return Err(GatewayError::Unavailable("sandbox offline".into()));
        }

        let id = match state.by_request_id.get(&request.idempotency_key) {
            Some(id) => id.clone(),
            None => {
                state.next_id += 1;
                let id = format!("RC-{:06}", state.next_id);
                state.orders.insert(
                    id.clone(),
                    SandboxOrder {
                        amount: request.amount,
                        status: SandboxOrderStatus::Created,
                        capture_id: None,
                    },
                );
                state
                    .by_request_id
                    .insert(request.idempotency_key.clone(), id.clone());
                id
            }
        };

        let amount = state.orders.get(&id).map_or(request.amount, |o| o.amount);
        Ok(CreatedIntent {
            approval_url: Some(format!("https://sandbox.paypal.test/checkoutnow?token={id}")),
            provider_reference: Some(id),
            amount,
        })
    }

    async fn capture(&self, provider_reference: &str) -> Result<ConfirmationResult, GatewayError> {
        let mut state = self.write();
        state.capture_calls += 1;
        if state.unavailable {
            return Err(GatewayError::Unavailable("sandbox offline".into()));
        }

        let decline = state.decline_captures;
        let times_out = state.capture_times_out;
        let reported_amount = state.captured_amount;
        let next_id = state.next_id + 1;
        let order = state
            .orders
            .get_mut(provider_reference)
            .ok_or_else(|| GatewayError::UnknownReference(provider_reference.to_string()))?;

        let mut issued_id = false;
        match order.status {
            SandboxOrderStatus::Declined => {
                return Ok(ConfirmationResult::Declined {
                    reason: "INSTRUMENT_DECLINED".into(),
                });
            }
            SandboxOrderStatus::Created if decline => {
                order.status = SandboxOrderStatus::Declined;
                return Ok(ConfirmationResult::Declined {
                    reason: "INSTRUMENT_DECLINED".into(),
                });
            }
            SandboxOrderStatus::Created => {
                order.status = SandboxOrderStatus::Captured;
                order.capture_id = Some(format!("CAP-{next_id:06}"));
                issued_id = true;
            }
            SandboxOrderStatus::Captured => {}
        }

        let result = ConfirmationResult::Captured {
            transaction_id: order.capture_id.clone().unwrap_or_default(),
            amount: reported_amount.unwrap_or(order.amount),
        };
        if issued_id {
            state.next_id = next_id;
        }
        if times_out {
            return Err(GatewayError::Timeout);
        }
        Ok(result)
    }

    async fn get_order(&self, provider_reference: &str) -> Result<ProviderStatus, GatewayError> {
        let mut state = self.write();
        state.get_calls += 1;
        if state.unavailable {
            return Err(GatewayError::Unavailable("sandbox offline".into()));
        }
        let reported_amount = state.captured_amount;
        let order = state
            .orders
            .get(provider_reference)
            .ok_or_else(|| GatewayError::UnknownReference(provider_reference.to_string()))?;

        Ok(match order.status {
            SandboxOrderStatus::Created => ProviderStatus::Pending,
            SandboxOrderStatus::Captured => ProviderStatus::Paid {
                transaction_id: order.capture_id.clone().unwrap_or_default(),
                amount: reported_amount.unwrap_or(order.amount),
            },
            SandboxOrderStatus::Declined => ProviderStatus::Failed {
                reason: "INSTRUMENT_DECLINED".into(),
            },
        })
    }
}

#[derive(Debug, Clone)]
struct SandboxPayment {
    request_id: String,
    amount: Money,
    description: String,
    result: Option<(i32, i64)>,
}

#[derive(Debug, Default)]
struct SignedCallbackState {
    payments: HashMap<String, SandboxPayment>,
    create_calls: usize,
    query_calls: usize,
    unavailable: bool,
}

/// Signed-callback sandbox. Tests settle payments with [`complete`] and
/// get back the callback body the provider would have sent.
///
/// [`complete`]: InMemorySignedCallback::complete
#[derive(Debug, Clone)]
pub struct InMemorySignedCallback {
    codec: CallbackCodec,
    state: Arc<RwLock<SignedCallbackState>>,
}

impl InMemorySignedCallback {
    pub fn new(codec: CallbackCodec) -> Self {
        Self {
            codec,
            state: Arc::default(),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.write().unavailable = unavailable;
    }

    pub fn create_calls(&self) -> usize {
        self.read().create_calls
    }

    pub fn query_calls(&self) -> usize {
        self.read().query_calls
    }

    /// Marks the payment paid and returns the signed success callback.
    pub fn complete(&self, provider_reference: &str, trans_id: i64) -> Result<Vec<u8>, GatewayError> {
        self.settle(provider_reference, 0, trans_id, None)
    }

    /// Marks the payment failed with `result_code` and returns the callback.
    pub fn fail(&self, provider_reference: &str, result_code: i32) -> Result<Vec<u8>, GatewayError> {
        self.settle(provider_reference, result_code, 0, None)
    }

    /// Marks the payment paid but reports `amount` in the callback, as a
    /// provider that settled a different amount would.
    pub fn complete_with_amount(
        &self,
        provider_reference: &str,
        trans_id: i64,
        amount: i64,
    ) -> Result<Vec<u8>, GatewayError> {
        self.settle(provider_reference, 0, trans_id, Some(amount))
    }

    fn settle(
        &self,
        provider_reference: &str,
        result_code: i32,
        trans_id: i64,
        reported_amount: Option<i64>,
    ) -> Result<Vec<u8>, GatewayError> {
        let mut state = self.write();
        let payment = state
            .payments
            .get_mut(provider_reference)
            .ok_or_else(|| GatewayError::UnknownReference(provider_reference.to_string()))?;
        payment.result = Some((result_code, trans_id));

        let mut payload = CallbackPayload {
            partner_code: self.codec.partner_code().to_string(),
            order_id: provider_reference.to_string(),
            request_id: payment.request_id.clone(),
            amount: reported_amount.unwrap_or(payment.amount.amount_minor()),
            order_info: payment.description.clone(),
            order_type: "momo_wallet".into(),
            trans_id,
            result_code,
            message: if result_code == 0 {
                "Successful.".into()
            } else {
                "Transaction denied by user.".into()
            },
            pay_type: "qr".into(),
            response_time: chrono::Utc::now().timestamp_millis(),
            extra_data: String::new(),
            signature: String::new(),
        };
        self.codec.sign(&mut payload);
        serde_json::to_vec(&payload).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SignedCallbackState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SignedCallbackState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SignedCallbackApi for InMemorySignedCallback {
    async fn create_payment(&self, request: &IntentRequest) -> Result<CreatedIntent, GatewayError> {
        let mut state = self.write();
        state.create_calls += 1;
        if state.unavailable {
            return Err(GatewayError::Unavailable("sandbox offline".into()));
        }

        let reference = provider_order_id(&request.idempotency_key);
        let payment = state
            .payments
            .entry(reference.clone())
            .or_insert_with(|| SandboxPayment {
                request_id: request.intent_id.to_string(),
                amount: request.amount,
                description: request.description.clone(),
                result: None,
            });

        Ok(CreatedIntent {
            approval_url: Some(format!(
                "https://test-payment.momo.test/pay?orderId={reference}"
            )),
            provider_reference: Some(reference),
            amount: payment.amount,
        })
    }

    async fn query(&self, provider_reference: &str) -> Result<ProviderStatus, GatewayError> {
        let mut state = self.write();
        state.query_calls += 1;
        if state.unavailable {
            return Err(GatewayError::Unavailable("sandbox offline".into()));
        }
        let payment = state
            .payments
            .get(provider_reference)
            .ok_or_else(|| GatewayError::UnknownReference(provider_reference.to_string()))?;

        Ok(match payment.result {
            None => ProviderStatus::Pending,
            Some((code, trans_id)) => status_for(code, &trans_id.to_string(), payment.amount, "sandbox"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use domain::Currency;
    use secrecy::SecretString;
    use uuid::Uuid;

    fn request(idempotency_key: &str, amount: Money) -> IntentRequest {
        IntentRequest {
            order_id: AggregateId::new(),
            intent_id: Uuid::new_v4(),
            amount,
            idempotency_key: idempotency_key.into(),
            description: "Order".into(),
        }
    }

    #[tokio::test]
    async fn same_request_id_returns_same_order() {
        let sandbox = InMemoryRedirectCapture::new();
        let req = request("o:1", Money::new(682, Currency::Usd));
        let first = sandbox.create_order(&req).await.unwrap();
        let second = sandbox.create_order(&req).await.unwrap();
        assert_eq!(first.provider_reference, second.provider_reference);
        assert_eq!(sandbox.create_calls(), 2);
    }

    #[tokio::test]
    async fn capture_is_idempotent_at_the_provider() {
        let sandbox = InMemoryRedirectCapture::new();
        let created = sandbox
            .create_order(&request("o:1", Money::new(682, Currency::Usd)))
            .await
            .unwrap();
        let reference = created.provider_reference.unwrap();

        let first = sandbox.capture(&reference).await.unwrap();
        let second = sandbox.capture(&reference).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sandbox.captured_count(), 1);
    }

    #[tokio::test]
    async fn timed_out_capture_is_visible_on_query() {
        let sandbox = InMemoryRedirectCapture::new();
        sandbox.set_capture_times_out(true);
        let created = sandbox
            .create_order(&request("o:1", Money::new(682, Currency::Usd)))
            .await
            .unwrap();
        let reference = created.provider_reference.unwrap();

        assert_eq!(sandbox.capture(&reference).await, Err(GatewayError::Timeout));
        assert!(matches!(
            sandbox.get_order(&reference).await.unwrap(),
            ProviderStatus::Paid { .. }
        ));
    }

    #[tokio::test]
    async fn signed_sandbox_callbacks_verify() {
        let codec = CallbackCodec::new("PARTNER", "ACCESS", SecretString::new("secret".into()));
        let sandbox = InMemorySignedCallback::new(codec.clone());
        let order_id = AggregateId::new();
        let mut req = request(&format!("{order_id}:1"), Money::new(170_500, Currency::Vnd));
        req.order_id = order_id;
        let reference = sandbox
            .create_payment(&req)
            .await
            .unwrap()
            .provider_reference
            .unwrap();

        let body = sandbox.complete(&reference, 77).unwrap();
        let notice = codec.parse(&body).unwrap();
        assert_eq!(notice.order_id, order_id);
        assert_eq!(notice.amount, Money::new(170_500, Currency::Vnd));
        assert!(matches!(
            sandbox.query(&reference).await.unwrap(),
            ProviderStatus::Paid { .. }
        ));
    }
}
