//! Configuration module for subscription-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub billing: BillingSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Knobs of the billing core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSettings {
    /// Currency stamped on payments created without one.
    pub default_currency: String,
    /// Reads per unit of work above which a possible N+1 is logged.
    pub n_plus_one_threshold: usize,
    /// Default window for the expiring-soon report.
    pub expiring_days_ahead: i64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            default_currency: "RUB".to_string(),
            n_plus_one_threshold: 10,
            expiring_days_ahead: 3,
        }
    }
}

impl BillingSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_currency: env::var("BILLING_DEFAULT_CURRENCY")
                .map(|c| c.trim().to_uppercase())
                .ok()
                .filter(|c| c.len() == 3)
                .unwrap_or(defaults.default_currency),
            n_plus_one_threshold: env_parse("BILLING_N_PLUS_ONE_THRESHOLD")
                .unwrap_or(defaults.n_plus_one_threshold),
            expiring_days_ahead: env_parse("BILLING_EXPIRING_DAYS_AHEAD")
                .filter(|days| *days > 0)
                .unwrap_or(defaults.expiring_days_ahead),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "subscription-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS").unwrap_or(2),
            },
            billing: BillingSettings::from_env(),
        })
    }
}
