use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing secret: set {var}")]
    MissingSecret { var: String },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditgateConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub identity: IdentityConfig,
    pub payments: PaymentsConfig,
    pub bonus: BonusConfig,
    pub poller: PollerConfig,
    pub pricing: PricingConfig,
}

impl CreditgateConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.visitor_initial_credits < 0 || self.identity.signup_credits < 0 {
            return Err(ConfigError::Invalid {
                reason: "initial credits must be >= 0".to_string(),
            });
        }
        if self.identity.visitor_ttl_days <= 0 {
            return Err(ConfigError::Invalid {
                reason: "identity.visitor_ttl_days must be > 0".to_string(),
            });
        }
        for (currency, rate) in &self.payments.currencies {
            if currency.is_empty() || *currency != currency.to_ascii_lowercase() {
                return Err(ConfigError::Invalid {
                    reason: format!("payments.currencies key {currency:?} must be lowercase"),
                });
            }
            if rate.credits_per_unit <= 0 || rate.min_amount <= 0 {
                return Err(ConfigError::Invalid {
                    reason: format!(
                        "payments.currencies.{currency}: credits_per_unit and min_amount must be > 0"
                    ),
                });
            }
        }
        if self.payments.rate_for(&self.payments.default_currency).is_none() {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "payments.default_currency {} is not listed in payments.currencies",
                    self.payments.default_currency
                ),
            });
        }
        if self.bonus.daily_credits <= 0 {
            return Err(ConfigError::Invalid {
                reason: "bonus.daily_credits must be > 0".to_string(),
            });
        }
        if self.poller.interval_ms == 0 || self.poller.max_total_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "poller.interval_ms and poller.max_total_ms must be > 0".to_string(),
            });
        }
        if self.poller.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                reason: "poller.max_consecutive_failures must be > 0".to_string(),
            });
        }
        if self.pricing.max_batch == 0 {
            return Err(ConfigError::Invalid {
                reason: "pricing.max_batch must be > 0".to_string(),
            });
        }
        if let Some((action, _)) = self.pricing.actions.iter().find(|(_, cost)| **cost <= 0) {
            return Err(ConfigError::Invalid {
                reason: format!("pricing for {action} must be > 0"),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub sqlite_path: Option<PathBuf>,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            sqlite_path: None,
            json_logs: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.aicoding.sh/v1".to_string(),
            api_key_env: "AICODING_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub session_secret_env: String,
    pub visitor_secret_env: String,
    pub visitor_ttl_days: i64,
    pub visitor_initial_credits: i64,
    pub signup_credits: i64,
    pub allow_anonymous_tasks: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            session_secret_env: "CREDITGATE_SESSION_SECRET".to_string(),
            visitor_secret_env: "CREDITGATE_VISITOR_SECRET".to_string(),
            visitor_ttl_days: 30,
            visitor_initial_credits: 1,
            signup_credits: 3,
            allow_anonymous_tasks: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub webhook_secret_env: String,
    /// Used when a checkout names no currency. Must be listed in `currencies`.
    pub default_currency: String,
    /// Accepted currencies keyed by lowercase code. A configured table replaces the defaults.
    pub currencies: BTreeMap<String, CurrencyRate>,
    pub signature_tolerance_secs: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyRate {
    /// Credits granted per whole unit of the currency.
    pub credits_per_unit: i64,
    pub min_amount: i64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        let mut currencies = BTreeMap::new();
        currencies.insert(
            "usd".to_string(),
            CurrencyRate {
                credits_per_unit: 10,
                min_amount: 1,
            },
        );
        currencies.insert(
            "cny".to_string(),
            CurrencyRate {
                credits_per_unit: 1,
                min_amount: 7,
            },
        );
        Self {
            webhook_secret_env: "STRIPE_WEBHOOK_SECRET".to_string(),
            default_currency: "usd".to_string(),
            currencies,
            signature_tolerance_secs: 300,
        }
    }
}

impl PaymentsConfig {
    pub fn rate_for(&self, currency: &str) -> Option<&CurrencyRate> {
        self.currencies.get(currency)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusConfig {
    pub daily_credits: i64,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self { daily_credits: 5 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub max_total_ms: u64,
    /// Time over which the simulated progress estimate ramps to its ceiling.
    pub progress_ramp_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 6_000,
            max_consecutive_failures: 5,
            max_total_ms: 600_000,
            progress_ramp_ms: 80_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub actions: BTreeMap<String, i64>,
    /// Return the reserved cost when the provider later reports the task failed.
    pub refund_failed_tasks: bool,
    /// Upper bound on `count` in one submission.
    pub max_batch: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let mut actions = BTreeMap::new();
        actions.insert("sora2".to_string(), 1);
        actions.insert("sora2-unwm".to_string(), 2);
        Self {
            actions,
            refund_failed_tasks: false,
            max_batch: 6,
        }
    }
}

impl PricingConfig {
    pub fn cost_of(&self, action_type: &str) -> Option<i64> {
        self.actions.get(action_type).copied()
    }
}

/// Signing secrets resolved from the environment variables a config names.
#[derive(Clone)]
pub struct Secrets {
    pub session: String,
    pub visitor: String,
    pub webhook: String,
    pub provider_api_key: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("session", &"<redacted>")
            .field("visitor", &"<redacted>")
            .field("webhook", &"<redacted>")
            .field("provider_api_key", &"<redacted>")
            .finish()
    }
}

impl Secrets {
    pub fn resolve(config: &CreditgateConfig, env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            session: env.require(&config.identity.session_secret_env)?,
            visitor: env.require(&config.identity.visitor_secret_env)?,
            webhook: env.require(&config.payments.webhook_secret_env)?,
            provider_api_key: env.require(&config.provider.api_key_env)?,
        })
    }
}

/// Process environment layered under an optional parsed `.env` file.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("dotenv_keys", &keys).finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    pub fn load_dotenv(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::parse_dotenv(&raw))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    pub fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingSecret {
            var: key.to_string(),
        })
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let mut value = raw_value.trim().to_string();
        if let Some(stripped) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        {
            value = stripped.to_string();
        }

        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = CreditgateConfig::from_toml_str("").expect("defaults");
        assert_eq!(config.poller.interval_ms, 6_000);
        assert_eq!(config.poller.max_consecutive_failures, 5);
        assert_eq!(config.poller.max_total_ms, 600_000);
        assert_eq!(config.identity.visitor_initial_credits, 1);
        assert_eq!(config.identity.visitor_ttl_days, 30);
        assert_eq!(config.bonus.daily_credits, 5);
        assert_eq!(config.pricing.cost_of("sora2-unwm"), Some(2));
        assert!(!config.pricing.refund_failed_tasks);
        assert_eq!(config.pricing.max_batch, 6);
        assert_eq!(config.payments.default_currency, "usd");
        assert_eq!(
            config.payments.rate_for("usd"),
            Some(&CurrencyRate {
                credits_per_unit: 10,
                min_amount: 1
            })
        );
        assert_eq!(config.payments.rate_for("cny").map(|rate| rate.min_amount), Some(7));
        assert_eq!(config.payments.rate_for("eur"), None);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = CreditgateConfig::from_toml_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [payments]
            default_currency = "eur"

            [payments.currencies.eur]
            credits_per_unit = 11
            min_amount = 2

            [pricing.actions]
            veo = 4
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.payments.rate_for("eur").map(|rate| rate.credits_per_unit), Some(11));
        assert_eq!(config.payments.rate_for("usd"), None);
        assert_eq!(config.payments.signature_tolerance_secs, 300);
        assert_eq!(config.pricing.cost_of("veo"), Some(4));
        assert_eq!(config.pricing.cost_of("sora2"), None);
    }

    #[test]
    fn rejects_unlisted_default_currency_and_bad_rates() {
        let err = CreditgateConfig::from_toml_str("[payments]\ndefault_currency = \"gbp\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = CreditgateConfig::from_toml_str(
            "[payments.currencies.usd]\ncredits_per_unit = 0\nmin_amount = 1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = CreditgateConfig::from_toml_str(
            "[payments.currencies.USD]\ncredits_per_unit = 10\nmin_amount = 1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_non_positive_prices() {
        let err = CreditgateConfig::from_toml_str("[pricing.actions]\nfree = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn secrets_resolve_from_dotenv_and_report_missing_vars() {
        let mut config = CreditgateConfig::default();
        config.provider.api_key_env = "CREDITGATE_TEST_PROVIDER_KEY_UNSET".to_string();
        let env = Env::parse_dotenv(
            "CREDITGATE_SESSION_SECRET=s\nCREDITGATE_VISITOR_SECRET=v\nSTRIPE_WEBHOOK_SECRET=w\n",
        );
        match Secrets::resolve(&config, &env) {
            Err(ConfigError::MissingSecret { var }) => {
                assert_eq!(var, "CREDITGATE_TEST_PROVIDER_KEY_UNSET")
            }
            other => panic!("unexpected: {other:?}"),
        }

        let env = Env::parse_dotenv(
            "CREDITGATE_SESSION_SECRET=s\nCREDITGATE_VISITOR_SECRET=v\nSTRIPE_WEBHOOK_SECRET=w\nCREDITGATE_TEST_PROVIDER_KEY_UNSET=k\n",
        );
        let secrets = Secrets::resolve(&config, &env).expect("secrets");
        assert_eq!(secrets.webhook, "w");
        assert!(!format!("{secrets:?}").contains("\"w\""));
    }

    #[test]
    fn dotenv_parsing_strips_quotes_and_exports() {
        let env = Env::parse_dotenv(
            "# comment\nexport CREDITGATE_SESSION_SECRET=\"abc\"\nEMPTY=\nSTRIPE_WEBHOOK_SECRET='whsec'\n",
        );
        assert_eq!(env.get("CREDITGATE_SESSION_SECRET").as_deref(), Some("abc"));
        assert_eq!(env.get("STRIPE_WEBHOOK_SECRET").as_deref(), Some("whsec"));
        assert!(!env.dotenv.contains_key("EMPTY"));
    }
}
