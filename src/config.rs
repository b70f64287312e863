//! Application configuration, read from the environment at startup.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Provider (SMS/voice transport) connection settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// REST API base, e.g. `https://api.example-telco.com/v1`.
    pub base_url: String,
    pub account_id: String,
    pub auth_token: SecretString,
    /// Per-request timeout in seconds. All provider calls are time-bounded.
    pub request_timeout_secs: u64,
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the webhook server binds, e.g. `0.0.0.0:8080`.
    pub bind_addr: String,
    /// Path to the local database file.
    pub db_path: String,
    /// Secret for HMAC-signing bridge tokens.
    pub signing_secret: SecretString,
    /// Public base URL provider voice webhooks are addressed under,
    /// e.g. `https://host.example.com/webhooks/voice`.
    pub voice_webhook_base: String,
    /// Default notification sender number when no agency number applies.
    pub notifications_from: Option<String>,
    pub provider: ProviderConfig,
    /// Seconds between SLA escalation sweep ticks.
    pub escalation_sweep_interval_secs: u64,
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an integer, got {raw:?}"),
        }),
    }
}

impl AppConfig {
    /// Build configuration from `SWITCHBOARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: std::env::var("SWITCHBOARD_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            db_path: std::env::var("SWITCHBOARD_DB_PATH")
                .unwrap_or_else(|_| "./data/switchboard.db".to_string()),
            signing_secret: SecretString::from(required("SWITCHBOARD_SIGNING_SECRET")?),
            voice_webhook_base: required("SWITCHBOARD_VOICE_WEBHOOK_BASE")?,
            notifications_from: std::env::var("SWITCHBOARD_NOTIFICATIONS_FROM").ok(),
            provider: ProviderConfig {
                base_url: required("SWITCHBOARD_PROVIDER_BASE_URL")?,
                account_id: required("SWITCHBOARD_PROVIDER_ACCOUNT_ID")?,
                auth_token: SecretString::from(required("SWITCHBOARD_PROVIDER_AUTH_TOKEN")?),
                request_timeout_secs: parse_u64("SWITCHBOARD_PROVIDER_TIMEOUT_SECS", 10)?,
            },
            escalation_sweep_interval_secs: parse_u64("SWITCHBOARD_SWEEP_INTERVAL_SECS", 300)?,
        })
    }
}
