//! Integer money, currencies and the amount-matching policy.
//!
//! Amounts are always whole minor units (`i64`). Conversions between
//! currencies go through `rust_decimal` and are rounded half away from zero
//! onto the target currency's minor unit; floats never touch an amount.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    #[error("amount overflow")]
    Overflow,

    #[error("no exchange rate configured from {from} to {to}")]
    MissingRate { from: Currency, to: Currency },

    #[error("invalid amount '{0}'")]
    InvalidAmount(String),

    #[error("unknown currency '{0}'")]
    UnknownCurrency(String),
}

/// ISO-4217 currencies the storefront and its providers deal in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Vnd,
    Usd,
    Eur,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Vnd => "VND",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    /// Number of decimal places of the minor unit.
    pub fn exponent(&self) -> u32 {
        match self {
            Currency::Vnd => 0,
            Currency::Usd | Currency::Eur => 2,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VND" => Ok(Currency::Vnd),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            other => Err(MoneyError::UnknownCurrency(other.to_string())),
        }
    }
}

/// An amount in minor units of a currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Money {
    amount: i64,
    currency: Currency,
}

impl Money {
    pub fn new(amount_minor: i64, currency: Currency) -> Self {
        Self {
            amount: amount_minor,
            currency,
        }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(0, currency)
    }

    /// Parses a provider wire amount such as `"6.82"`.
    ///
    /// More decimal places than the currency allows is an error rather than
    /// a silent rounding.
    pub fn from_decimal_str(value: &str, currency: Currency) -> Result<Self, MoneyError> {
        let major = Decimal::from_str(value.trim())
            .map_err(|_| MoneyError::InvalidAmount(value.to_string()))?;
        let minor = major * Decimal::from(10_i64.pow(currency.exponent()));
        if !minor.fract().is_zero() {
            return Err(MoneyError::InvalidAmount(value.to_string()));
        }
        let amount = minor
            .to_i64()
            .ok_or_else(|| MoneyError::InvalidAmount(value.to_string()))?;
        Ok(Self::new(amount, currency))
    }

    pub fn amount_minor(&self) -> i64 {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn checked_add(&self, other: Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        self.amount
            .checked_add(other.amount)
            .map(|amount| Money::new(amount, self.currency))
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_mul(&self, quantity: u32) -> Result<Money, MoneyError> {
        self.amount
            .checked_mul(i64::from(quantity))
            .map(|amount| Money::new(amount, self.currency))
            .ok_or(MoneyError::Overflow)
    }

    /// Amount in major units, e.g. `6.82` for 682 cents.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.amount, self.currency.exponent())
    }

    /// Major-unit string as provider APIs expect it (`"6.82"`, `"170500"`).
    pub fn to_decimal_string(&self) -> String {
        self.to_decimal().to_string()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.to_decimal_string(), self.currency)
    }
}

/// A configured conversion rate: one unit of `from` buys `rate` units of `to`.
///
/// Rates come from configuration and are an approximation for matching
/// display-currency totals against settlement amounts. They are not a
/// source of truth for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: Currency,
    pub to: Currency,
    pub rate: Decimal,
}

impl ExchangeRate {
    pub fn new(from: Currency, to: Currency, rate: Decimal) -> Self {
        Self { from, to, rate }
    }
}

/// Decides whether a received amount settles an order total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountPolicy {
    /// Largest accepted difference, in minor units of the received currency.
    tolerance_minor: i64,
    rates: Vec<ExchangeRate>,
}

impl Default for AmountPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AmountPolicy {
    pub fn new(tolerance_minor: i64) -> Self {
        Self {
            tolerance_minor: tolerance_minor.abs(),
            rates: Vec::new(),
        }
    }

    pub fn with_rate(mut self, rate: ExchangeRate) -> Self {
        self.rates.retain(|r| !(r.from == rate.from && r.to == rate.to));
        self.rates.push(rate);
        self
    }

    pub fn tolerance_minor(&self) -> i64 {
        self.tolerance_minor
    }

    pub fn rates(&self) -> &[ExchangeRate] {
        &self.rates
    }

    /// Converts `amount` into `to`, using a direct rate or the inverse of
    /// the opposite one.
    pub fn convert(&self, amount: Money, to: Currency) -> Result<Money, MoneyError> {
        let from = amount.currency();
        if from == to {
            return Ok(amount);
        }

        let rate = self
            .rates
            .iter()
            .find(|r| r.from == from && r.to == to)
            .map(|r| r.rate)
            .or_else(|| {
                self.rates
                    .iter()
                    .find(|r| r.from == to && r.to == from && !r.rate.is_zero())
                    .and_then(|r| Decimal::ONE.checked_div(r.rate))
            })
            .ok_or(MoneyError::MissingRate { from, to })?;

        let target_minor = amount
            .to_decimal()
            .checked_mul(rate)
            .and_then(|major| major.checked_mul(Decimal::from(10_i64.pow(to.exponent()))))
            .ok_or(MoneyError::Overflow)?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

        target_minor
            .to_i64()
            .map(|minor| Money::new(minor, to))
            .ok_or(MoneyError::Overflow)
    }

    /// Signed difference `received - expected`, in the received currency.
    pub fn difference(&self, expected: Money, received: Money) -> Result<i64, MoneyError> {
        let expected = self.convert(expected, received.currency())?;
        received
            .amount_minor()
            .checked_sub(expected.amount_minor())
            .ok_or(MoneyError::Overflow)
    }

    pub fn matches(&self, expected: Money, received: Money) -> Result<bool, MoneyError> {
        Ok(self.difference(expected, received)?.abs() <= self.tolerance_minor)
    }
}
