//! Configuration for subscription-service.

use serde::Deserialize;
use service_core::error::AppError;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    /// Absent for deployments backed by the in-memory store.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub payments: PaymentSettings,
    #[serde(default)]
    pub subscriptions: LifecycleSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Payment coordination settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentSettings {
    /// Allow-list of payment method names.
    #[serde(default = "default_supported_methods")]
    pub supported_methods: Vec<String>,
    /// Upper bound for any single gateway call.
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
}

impl PaymentSettings {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            supported_methods: default_supported_methods(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Defaults applied when callers do not pick a term themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_duration_days")]
    pub default_duration_days: i64,
    #[serde(default = "default_recurring")]
    pub default_recurring: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            default_duration_days: default_duration_days(),
            default_recurring: default_recurring(),
        }
    }
}

impl SubscriptionConfig {
    /// Load from `configuration.*` and `APP__*` environment variables.
    /// `APP__PAYMENTS__SUPPORTED_METHODS` takes a comma-separated list.
    pub fn load() -> Result<Self, AppError> {
        service_core::config::load_from("configuration", &["payments.supported_methods"])
    }
}

fn default_service_name() -> String {
    "subscription-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_supported_methods() -> Vec<String> {
    vec!["stripe".to_string()]
}

fn default_gateway_timeout_secs() -> u64 {
    30
}

fn default_duration_days() -> i64 {
    30
}

fn default_recurring() -> bool {
    true
}
