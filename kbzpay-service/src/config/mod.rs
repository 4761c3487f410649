use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::error::AppError;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub kbzpay: KbzPayConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Where payment orders and purchases are persisted.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Mongodb,
    /// Process-local storage for development and tests; lost on restart.
    Memory,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_database_url")]
    pub url: Secret<String>,
    #[serde(default = "default_db_name")]
    pub db_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: default_database_url(),
            db_name: default_db_name(),
        }
    }
}

/// Merchant credentials and endpoints for the KBZPay gateway.
#[derive(Deserialize, Clone, Debug)]
pub struct KbzPayConfig {
    /// Base URL of the gateway API, e.g. `https://api.kbzpay.com/payment/gateway/uat`.
    pub api_base_url: String,
    /// PWA checkout page the payer is redirected to.
    pub redirect_base_url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub merchant_code: String,
    #[serde(default = "empty_secret")]
    pub app_key: Secret<String>,
    /// Public URL of our `/kbzpay-callback` route.
    #[serde(default)]
    pub notify_url: String,
    #[serde(default = "default_trade_type")]
    pub trade_type: String,
    #[serde(default = "default_timeout_express")]
    pub timeout_express: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl KbzPayConfig {
    pub fn is_configured(&self) -> bool {
        !self.app_id.is_empty()
            && !self.merchant_code.is_empty()
            && !self.app_key.expose_secret().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    /// How long the callback handler waits for local processing before
    /// acknowledging anyway.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl WebhookConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ReconciliationConfig {
    /// Pending orders younger than this are left for the webhook.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Run the pending sweep periodically when set.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            batch_size: default_batch_size(),
            interval_secs: None,
        }
    }
}

impl Config {
    /// Load from the optional `configuration` file and `APP__*` environment
    /// variables (`APP__KBZPAY__APP_KEY`, `APP__DATABASE__BACKEND`, ...).
    pub fn load() -> Result<Self, AppError> {
        service_core::config::load()
    }
}

fn default_service_name() -> String {
    "kbzpay-service".to_string()
}

fn default_log_level() -> String {
    "info,kbzpay_service=debug".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3003
}

fn default_database_url() -> Secret<String> {
    Secret::new("mongodb://localhost:27017".to_string())
}

fn default_db_name() -> String {
    "kbzpay_db".to_string()
}

fn empty_secret() -> Secret<String> {
    Secret::new(String::new())
}

fn default_trade_type() -> String {
    "PWAAPP".to_string()
}

fn default_timeout_express() -> String {
    "120m".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    1
}

fn default_ack_timeout_ms() -> u64 {
    3000
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    50
}
