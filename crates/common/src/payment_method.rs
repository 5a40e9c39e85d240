use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The payment rail chosen for an order.
///
/// Also names the provider segment of the `/payments/{provider}/...` routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Cash collected by the carrier on delivery.
    Cod,
    /// Payer approves on the provider's page, we capture synchronously.
    RedirectCapture,
    /// Payer is redirected, completion arrives as a signed callback.
    SignedCallback,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 3] = [
        PaymentMethod::Cod,
        PaymentMethod::RedirectCapture,
        PaymentMethod::SignedCallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cod => "cod",
            PaymentMethod::RedirectCapture => "redirect_capture",
            PaymentMethod::SignedCallback => "signed_callback",
        }
    }

    /// True for methods where money moves before the parcel leaves.
    pub fn is_prepaid(&self) -> bool {
        !matches!(self, PaymentMethod::Cod)
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown payment provider '{0}'")]
pub struct UnknownPaymentMethod(pub String);

impl FromStr for PaymentMethod {
    type Err = UnknownPaymentMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cod" | "cash_on_delivery" => Ok(PaymentMethod::Cod),
            "redirect_capture" => Ok(PaymentMethod::RedirectCapture),
            "signed_callback" => Ok(PaymentMethod::SignedCallback),
            _ => Err(UnknownPaymentMethod(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_route_segments() {
        for method in PaymentMethod::ALL {
            assert_eq!(method.as_str().parse::<PaymentMethod>().unwrap(), method);
        }
        assert_eq!(
            "Redirect-Capture".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::RedirectCapture
        );
        assert!("paypal".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn only_cod_is_postpaid() {
        assert!(!PaymentMethod::Cod.is_prepaid());
        assert!(PaymentMethod::RedirectCapture.is_prepaid());
        assert!(PaymentMethod::SignedCallback.is_prepaid());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&PaymentMethod::SignedCallback).unwrap();
        assert_eq!(json, "\"signed_callback\"");
    }
}
