use super::{CreatedIntent, IntentRequest};

/// Cash on delivery. The intent is a local record; the carrier collects
/// the cash and an operator marks the order paid.
#[derive(Debug, Clone, Copy, Default)]
pub struct CashOnDelivery;

impl CashOnDelivery {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn create_intent(&self, request: &IntentRequest) -> CreatedIntent {
        CreatedIntent {
            provider_reference: None,
            approval_url: None,
            amount: request.amount,
        }
    }
}
