//! Application configuration loaded from environment variables.
//!
//! Provider credentials are optional: a rail whose credentials are absent
//! runs against the in-process sandbox, and no `DATABASE_URL` means
//! in-memory stores. A variable that is present but unparsable is an
//! error, never a silent default.

use std::time::Duration;

use domain::{AmountPolicy, Currency, ExchangeRate};
use orchestrator::PollerConfig;
use rust_decimal::Decimal;
use secrecy::SecretString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}: invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{name} is required when {because} is set")]
    Missing {
        name: &'static str,
        because: &'static str,
    },
}

/// Whether provider calls go to sandbox or production endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaymentEnv {
    #[default]
    Sandbox,
    Live,
}

impl PaymentEnv {
    pub fn is_live(&self) -> bool {
        matches!(self, PaymentEnv::Live)
    }
}

#[derive(Debug, Clone)]
pub struct RedirectCaptureSettings {
    pub client_id: String,
    pub client_secret: SecretString,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignedCallbackSettings {
    pub partner_code: String,
    pub access_key: String,
    pub secret_key: SecretString,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CarrierSettings {
    pub token: SecretString,
    pub shop_id: String,
    pub base_url: Option<String>,
}

/// Server configuration.
///
/// Reads `HOST`, `PORT`, `RUST_LOG`, `LOG_FORMAT`, `DATABASE_URL`,
/// `PUBLIC_BASE_URL`, `PAYMENT_ENV`, the `REDIRECT_CAPTURE_*`,
/// `SIGNED_CALLBACK_*` and `CARRIER_*` credentials, `EXCHANGE_RATES`,
/// `AMOUNT_TOLERANCE_MINOR`, `PROVIDER_TIMEOUT_SECS`,
/// `RECONCILIATION_INTERVAL_SECS`, `RECONCILIATION_WINDOW_SECS`,
/// `INTENT_TTL_SECS` and `RECEIPT_RETENTION_HOURS`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub public_base_url: String,
    pub payment_env: PaymentEnv,
    pub redirect_capture: Option<RedirectCaptureSettings>,
    /// Settlement currency of the redirect-capture rail.
    pub redirect_capture_currency: Currency,
    pub signed_callback: Option<SignedCallbackSettings>,
    pub carrier: Option<CarrierSettings>,
    pub exchange_rates: Vec<ExchangeRate>,
    pub amount_tolerance_minor: i64,
    pub provider_timeout: Duration,
    pub poller: PollerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            public_base_url: "http://localhost:3000".to_string(),
            payment_env: PaymentEnv::Sandbox,
            redirect_capture: None,
            redirect_capture_currency: Currency::Usd,
            signed_callback: None,
            carrier: None,
            exchange_rates: Vec::new(),
            amount_tolerance_minor: 1,
            provider_timeout: Duration::from_secs(10),
            poller: PollerConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from any variable source. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let log_json = match get("LOG_FORMAT") {
            None => false,
            Some(format) => match format.to_ascii_lowercase().as_str() {
                "json" => true,
                "text" | "pretty" | "plain" => false,
                _ => return Err(invalid("LOG_FORMAT", &format, "expected 'json' or 'text'")),
            },
        };

        let payment_env = match get("PAYMENT_ENV") {
            None => PaymentEnv::Sandbox,
            Some(env) => match env.to_ascii_lowercase().as_str() {
                "sandbox" | "test" => PaymentEnv::Sandbox,
                "live" | "production" => PaymentEnv::Live,
                _ => return Err(invalid("PAYMENT_ENV", &env, "expected 'sandbox' or 'live'")),
            },
        };

        let redirect_capture = match get("REDIRECT_CAPTURE_CLIENT_ID") {
            None => None,
            Some(client_id) => Some(RedirectCaptureSettings {
                client_id,
                client_secret: SecretString::new(required(
                    &get,
                    "REDIRECT_CAPTURE_CLIENT_SECRET",
                    "REDIRECT_CAPTURE_CLIENT_ID",
                )?),
                base_url: get("REDIRECT_CAPTURE_BASE_URL"),
            }),
        };
        let redirect_capture_currency = match get("REDIRECT_CAPTURE_CURRENCY") {
            None => defaults.redirect_capture_currency,
            Some(code) => code
                .parse()
                .map_err(|e: domain::MoneyError| invalid("REDIRECT_CAPTURE_CURRENCY", &code, e))?,
        };

        let signed_callback = match get("SIGNED_CALLBACK_PARTNER_CODE") {
            None => None,
            Some(partner_code) => Some(SignedCallbackSettings {
                partner_code,
                access_key: required(
                    &get,
                    "SIGNED_CALLBACK_ACCESS_KEY",
                    "SIGNED_CALLBACK_PARTNER_CODE",
                )?,
                secret_key: SecretString::new(required(
                    &get,
                    "SIGNED_CALLBACK_SECRET_KEY",
                    "SIGNED_CALLBACK_PARTNER_CODE",
                )?),
                base_url: get("SIGNED_CALLBACK_BASE_URL"),
            }),
        };

        let carrier = match get("CARRIER_TOKEN") {
            None => None,
            Some(token) => Some(CarrierSettings {
                token: SecretString::new(token),
                shop_id: required(&get, "CARRIER_SHOP_ID", "CARRIER_TOKEN")?,
                base_url: get("CARRIER_BASE_URL"),
            }),
        };

        let exchange_rates = match get("EXCHANGE_RATES") {
            None => Vec::new(),
            Some(rates) => parse_exchange_rates(&rates)?,
        };

        let poller = PollerConfig {
            interval: seconds(&get, "RECONCILIATION_INTERVAL_SECS", defaults.poller.interval)?,
            window: seconds(&get, "RECONCILIATION_WINDOW_SECS", defaults.poller.window)?,
            intent_ttl: seconds(&get, "INTENT_TTL_SECS", defaults.poller.intent_ttl)?,
            receipt_retention: match get("RECEIPT_RETENTION_HOURS") {
                None => defaults.poller.receipt_retention,
                Some(hours) => Duration::from_secs(
                    parse::<u64>("RECEIPT_RETENTION_HOURS", &hours)?.saturating_mul(3600),
                ),
            },
            concurrency: defaults.poller.concurrency,
        };
        if poller.interval.is_zero() {
            return Err(invalid("RECONCILIATION_INTERVAL_SECS", "0", "must be positive"));
        }

        let amount_tolerance_minor = match get("AMOUNT_TOLERANCE_MINOR") {
            None => defaults.amount_tolerance_minor,
            Some(value) => {
                let tolerance = parse::<i64>("AMOUNT_TOLERANCE_MINOR", &value)?;
                if tolerance < 0 {
                    return Err(invalid("AMOUNT_TOLERANCE_MINOR", &value, "must not be negative"));
                }
                tolerance
            }
        };

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: match get("PORT") {
                None => defaults.port,
                Some(port) => parse("PORT", &port)?,
            },
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
            log_json,
            database_url: get("DATABASE_URL"),
            public_base_url: get("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_base_url),
            payment_env,
            redirect_capture,
            redirect_capture_currency,
            signed_callback,
            carrier,
            exchange_rates,
            amount_tolerance_minor,
            provider_timeout: seconds(&get, "PROVIDER_TIMEOUT_SECS", defaults.provider_timeout)?,
            poller,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn amount_policy(&self) -> AmountPolicy {
        self.exchange_rates
            .iter()
            .copied()
            .fold(AmountPolicy::new(self.amount_tolerance_minor), AmountPolicy::with_rate)
    }

    /// Public URL of a route on this server, for provider redirects and
    /// callbacks.
    pub fn public_url(&self, path: &str) -> String {
        format!("{}{}", self.public_base_url, path)
    }
}

/// Parses `FROM:TO=RATE` pairs separated by commas, e.g.
/// `VND:USD=0.00004,EUR:USD=1.08`.
pub fn parse_exchange_rates(value: &str) -> Result<Vec<ExchangeRate>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (currencies, rate) = pair
                .split_once('=')
                .ok_or_else(|| invalid("EXCHANGE_RATES", pair, "expected FROM:TO=RATE"))?;
            let (from, to) = currencies
                .split_once(':')
                .ok_or_else(|| invalid("EXCHANGE_RATES", pair, "expected FROM:TO=RATE"))?;
            let from: Currency = from
                .parse()
                .map_err(|e: domain::MoneyError| invalid("EXCHANGE_RATES", pair, e))?;
            let to: Currency = to
                .parse()
                .map_err(|e: domain::MoneyError| invalid("EXCHANGE_RATES", pair, e))?;
            let rate: Decimal = rate
                .trim()
                .parse()
                .map_err(|e| invalid("EXCHANGE_RATES", pair, e))?;
            if rate <= Decimal::ZERO {
                return Err(invalid("EXCHANGE_RATES", pair, "rate must be positive"));
            }
            Ok(ExchangeRate::new(from, to, rate))
        })
        .collect()
}

fn invalid(name: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| invalid(name, value, e))
}

fn required(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    because: &'static str,
) -> Result<String, ConfigError> {
    get(name).ok_or(ConfigError::Missing { name, because })
}

fn seconds(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(value) => parse::<u64>(name, &value).map(Duration::from_secs),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert!(config.database_url.is_none());
        assert!(config.redirect_capture.is_none());
        assert_eq!(config.amount_tolerance_minor, 1);
        assert_eq!(config.poller, PollerConfig::default());
    }

    #[test]
    fn test_provider_credentials() {
        let config = load(&[
            ("SIGNED_CALLBACK_PARTNER_CODE", "MOMOTEST"),
            ("SIGNED_CALLBACK_ACCESS_KEY", "access"),
            ("SIGNED_CALLBACK_SECRET_KEY", "secret"),
            ("PAYMENT_ENV", "live"),
            ("PUBLIC_BASE_URL", "https://shop.example/"),
        ])
        .unwrap();
        let momo = config.signed_callback.as_ref().unwrap();
        assert_eq!(momo.partner_code, "MOMOTEST");
        assert!(config.payment_env.is_live());
        assert_eq!(
            config.public_url("/payments/signed_callback/callback"),
            "https://shop.example/payments/signed_callback/callback"
        );
    }

    #[test]
    fn test_partial_credentials_are_rejected() {
        let err = load(&[("CARRIER_TOKEN", "t")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                name: "CARRIER_SHOP_ID",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(load(&[("PORT", "http")]).is_err());
        assert!(load(&[("AMOUNT_TOLERANCE_MINOR", "-3")]).is_err());
        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
        assert!(load(&[("REDIRECT_CAPTURE_CURRENCY", "JPY")]).is_err());
        assert!(load(&[("RECONCILIATION_INTERVAL_SECS", "0")]).is_err());
    }

    #[test]
    fn test_exchange_rates() {
        let rates = parse_exchange_rates("VND:USD=0.00004, EUR:USD=1.08").unwrap();
        assert_eq!(rates.len(), 2);
        assert!(parse_exchange_rates("VND-USD=1").is_err());
        assert!(parse_exchange_rates("VND:USD=0").is_err());

        let config = load(&[("EXCHANGE_RATES", "VND:USD=0.00004")]).unwrap();
        assert_eq!(config.amount_policy().rates().len(), 1);
    }

    #[test]
    fn test_poller_settings() {
        let config = load(&[
            ("RECONCILIATION_INTERVAL_SECS", "30"),
            ("RECONCILIATION_WINDOW_SECS", "120"),
            ("INTENT_TTL_SECS", "3600"),
            ("RECEIPT_RETENTION_HOURS", "48"),
        ])
        .unwrap();
        assert_eq!(config.poller.interval, Duration::from_secs(30));
        assert_eq!(config.poller.window, Duration::from_secs(120));
        assert_eq!(config.poller.intent_ttl, Duration::from_secs(3600));
        assert_eq!(config.poller.receipt_retention, Duration::from_secs(48 * 3600));
    }
}
