//! Value objects held by the order aggregate.

use chrono::{DateTime, Utc};
use common::PaymentMethod;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::{Money, MoneyError};

use super::state::{CarrierStatus, IntentStatus};

/// Weight assumed for catalog items that do not declare one.
pub const DEFAULT_ITEM_WEIGHT_GRAMS: u32 = 200;

/// Owner of an order, as handed over by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog reference (SKU).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One ordered product, frozen at order time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: ProductId,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub weight_grams: u32,
}

impl LineItem {
    pub fn new(
        product_id: impl Into<ProductId>,
        name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            name: name.into(),
            quantity,
            unit_price,
            weight_grams: DEFAULT_ITEM_WEIGHT_GRAMS,
        }
    }

    pub fn with_weight(mut self, weight_grams: u32) -> Self {
        self.weight_grams = weight_grams;
        self
    }

    pub fn line_total(&self) -> Result<Money, MoneyError> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// Delivery address snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub recipient_name: String,
    pub phone: String,
    pub street: String,
    pub ward: String,
    pub district: String,
    pub province: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl ShippingAddress {
    /// Name of the first required field that is blank, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("recipient_name", &self.recipient_name),
            ("phone", &self.phone),
            ("street", &self.street),
            ("district", &self.district),
            ("province", &self.province),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

/// One attempt to collect money for an order through one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: Uuid,
    pub provider: PaymentMethod,
    /// Provider-side order/transaction token, once the provider assigned one.
    pub provider_reference: Option<String>,
    /// Amount requested, in the provider's settlement currency.
    pub amount: Money,
    pub status: IntentStatus,
    /// `"{order_id}:{attempt}"`; stable across retries of the same attempt.
    pub idempotency_key: String,
    pub approval_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn idempotency_key_for(order_id: impl std::fmt::Display, attempt: usize) -> String {
        format!("{order_id}:{attempt}")
    }
}

/// Physical description of the parcel handed to the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parcel {
    pub weight_grams: u32,
    pub length_cm: u32,
    pub width_cm: u32,
    pub height_cm: u32,
}

impl Parcel {
    const LENGTH_CM: u32 = 30;
    const WIDTH_CM: u32 = 20;
    const HEIGHT_PER_TWO_ITEMS_CM: u32 = 5;
    const MAX_HEIGHT_CM: u32 = 150;

    /// Packs every unit into one box: weights add up, the box grows 5 cm in
    /// height for every two units.
    pub fn for_items(items: &[LineItem]) -> Self {
        let units: u32 = items.iter().map(|i| i.quantity).sum();
        let weight_grams = items
            .iter()
            .map(|i| i.weight_grams.saturating_mul(i.quantity))
            .fold(0_u32, u32::saturating_add)
            .max(1);
        let height_cm = (units.div_ceil(2) * Self::HEIGHT_PER_TWO_ITEMS_CM)
            .clamp(Self::HEIGHT_PER_TWO_ITEMS_CM, Self::MAX_HEIGHT_CM);

        Self {
            weight_grams,
            length_cm: Self::LENGTH_CM,
            width_cm: Self::WIDTH_CM,
            height_cm,
        }
    }
}

/// The carrier shipment of an order. At most one per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingDispatch {
    pub shipment_code: String,
    /// Client reference given to the carrier (the order id).
    pub reference: String,
    /// Cash the carrier collects on delivery; zero for prepaid orders.
    pub cod_amount: Money,
    pub parcel: Parcel,
    pub carrier_status: CarrierStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagKind {
    /// Confirmation amount outside tolerance of the order total.
    AmountMismatch,
    /// A second, different transaction for an already paid order.
    DuplicatePayment,
    /// Money arrived for an order that was cancelled.
    PaymentAfterCancellation,
    /// The carrier accepted a shipment for a cancelled order and would not void it.
    ShipmentAfterCancellation,
}

/// Operator-visible discrepancy between provider and order state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFlag {
    pub kind: FlagKind,
    pub transaction_id: String,
    pub expected: Money,
    pub received: Money,
    pub raised_at: DateTime<Utc>,
}

/// What produced a payment confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    Webhook,
    Capture,
    Reconciliation,
    /// Admin marked the order paid (COD cash reported, bank transfer, ...).
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    fn item(quantity: u32, weight: u32) -> LineItem {
        LineItem::new("SKU-1", "Mug", quantity, Money::new(50_000, Currency::Vnd))
            .with_weight(weight)
    }

    #[test]
    fn line_total_multiplies_quantity() {
        assert_eq!(
            item(3, 100).line_total().unwrap(),
            Money::new(150_000, Currency::Vnd)
        );
    }

    #[test]
    fn parcel_sums_weight_and_grows_with_units() {
        let parcel = Parcel::for_items(&[item(3, 250), item(2, 100)]);
        assert_eq!(parcel.weight_grams, 950);
        assert_eq!(parcel.height_cm, 15);
        assert_eq!(parcel.length_cm, 30);

        let single = Parcel::for_items(&[item(1, 0)]);
        assert_eq!(single.weight_grams, 1);
        assert_eq!(single.height_cm, 5);
    }

    #[test]
    fn address_reports_blank_fields() {
        let mut address = ShippingAddress {
            recipient_name: "Lan".into(),
            phone: "0901234567".into(),
            street: "12 Ly Thuong Kiet".into(),
            ward: "Ward 7".into(),
            district: "District 10".into(),
            province: "Ho Chi Minh".into(),
            note: None,
        };
        assert_eq!(address.missing_field(), None);
        address.phone = "  ".into();
        assert_eq!(address.missing_field(), Some("phone"));
    }

    #[test]
    fn idempotency_key_is_order_and_attempt() {
        assert_eq!(PaymentIntent::idempotency_key_for("abc", 2), "abc:2");
    }
}
