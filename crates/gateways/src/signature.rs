//! HMAC-SHA256 authentication of provider callbacks.
//!
//! Providers sign a canonical `key=value&key=value` string built from the
//! callback fields sorted by key. Verification recomputes the MAC with the
//! shared secret and compares it in constant time.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies messages with one provider's shared secret.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: SecretString,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Joins fields as `key=value` pairs sorted by key.
    pub fn canonical(fields: &[(&str, &str)]) -> String {
        let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        sorted
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Lowercase hex HMAC of `message`.
    pub fn sign(&self, message: &str) -> String {
        self.compute(message).map(hex::encode).unwrap_or_default()
    }

    pub fn sign_fields(&self, fields: &[(&str, &str)]) -> String {
        self.sign(&Self::canonical(fields))
    }

    pub fn verify_message(&self, message: &str, provided_mac: &str) -> bool {
        let Ok(provided) = hex::decode(provided_mac.trim()) else {
            return false;
        };
        let Some(expected) = self.compute(message) else {
            return false;
        };
        constant_time_compare(&expected, &provided)
    }

    pub fn verify_fields(&self, fields: &[(&str, &str)], provided_mac: &str) -> bool {
        self.verify_message(&Self::canonical(fields), provided_mac)
    }

    fn compute(&self, message: &str) -> Option<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()).ok()?;
        mac.update(message.as_bytes());
        Some(mac.finalize().into_bytes().to_vec())
    }
}

/// Checks `provided_mac` against an HMAC-SHA256 recomputed over the
/// canonical form of `raw_fields`.
pub fn verify(raw_fields: &[(&str, &str)], provided_mac: &str, secret: &SecretString) -> bool {
    SignatureVerifier::new(secret.clone()).verify_fields(raw_fields, provided_mac)
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretString {
        SecretString::new("K951B6PE1waDMi640xX08PD3vg6EkVlz".to_string())
    }

    fn fields() -> Vec<(&'static str, &'static str)> {
        vec![
            ("orderId", "ORDER-1"),
            ("amount", "170500"),
            ("resultCode", "0"),
            ("accessKey", "F8BBA842ECF85"),
        ]
    }

    #[test]
    fn canonical_form_sorts_keys() {
        assert_eq!(
            SignatureVerifier::canonical(&fields()),
            "accessKey=F8BBA842ECF85&amount=170500&orderId=ORDER-1&resultCode=0"
        );
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let verifier = SignatureVerifier::new(SecretString::new("Jefe".to_string()));
        assert_eq!(
            verifier.sign("what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn valid_mac_verifies() {
        let verifier = SignatureVerifier::new(secret());
        let mac = verifier.sign_fields(&fields());
        assert!(verifier.verify_fields(&fields(), &mac));
        assert!(verify(&fields(), &mac, &secret()));
    }

    #[test]
    fn field_order_does_not_matter() {
        let verifier = SignatureVerifier::new(secret());
        let mac = verifier.sign_fields(&fields());
        let mut reversed = fields();
        reversed.reverse();
        assert!(verifier.verify_fields(&reversed, &mac));
    }

    #[test]
    fn tampered_field_fails() {
        let verifier = SignatureVerifier::new(secret());
        let mac = verifier.sign_fields(&fields());
        let mut tampered = fields();
        tampered[1] = ("amount", "1000");
        assert!(!verifier.verify_fields(&tampered, &mac));
    }

    #[test]
    fn tampered_mac_fails() {
        let verifier = SignatureVerifier::new(secret());
        let mut mac = verifier.sign_fields(&fields());
        let last = if mac.ends_with('0') { "1" } else { "0" };
        mac.replace_range(mac.len() - 1.., last);
        assert!(!verifier.verify_fields(&fields(), &mac));
    }

    #[test]
    fn wrong_secret_fails() {
        let mac = SignatureVerifier::new(secret()).sign_fields(&fields());
        let other = SecretString::new("another-secret".to_string());
        assert!(!verify(&fields(), &mac, &other));
    }

    #[test]
    fn garbage_mac_fails() {
        let verifier = SignatureVerifier::new(secret());
        assert!(!verifier.verify_fields(&fields(), "not-hex"));
        assert!(!verifier.verify_fields(&fields(), ""));
        assert!(!verifier.verify_fields(&fields(), "abcd"));
    }
}
