//! Application configuration.

use crate::error::{AppError, AppResult};
use bitvavo_core::{Credentials, Market};
use bitvavo_rest::RestConfig;
use bitvavo_ws::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "BITVAVO_API_KEY";
/// Environment variable holding the API secret.
pub const ENV_API_SECRET: &str = "BITVAVO_API_SECRET";

/// API credentials as read from the file or environment.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_secret: Option<String>,
    /// Access window sent with every signed request (ms).
    #[serde(default = "default_access_window_ms")]
    pub access_window_ms: u64,
}

fn default_access_window_ms() -> u64 {
    10_000
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .field("access_window_ms", &self.access_window_ms)
            .finish()
    }
}

impl CredentialsConfig {
    /// Usable credentials, if both key and secret are non-empty.
    pub fn to_credentials(&self) -> Option<Credentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => Some(
                Credentials::new(key.clone(), secret.clone())
                    .with_access_window(self.access_window_ms),
            ),
            _ => None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Markets to follow, e.g. `BTC-EUR`.
    #[serde(default = "default_markets")]
    pub markets: Vec<String>,
    /// Candle interval to stream (e.g. `1m`). Disabled when unset.
    #[serde(default)]
    pub candle_interval: Option<String>,
    /// Also stream the ticker channel.
    #[serde(default)]
    pub ticker: bool,
    /// Interval for publishing connection metrics (ms).
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    #[serde(default)]
    pub websocket: ConnectionConfig,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

fn default_markets() -> Vec<String> {
    vec!["BTC-EUR".to_string()]
}

fn default_metrics_interval_ms() -> u64 {
    10_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            markets: default_markets(),
            candle_interval: None,
            ticker: false,
            metrics_interval_ms: default_metrics_interval_ms(),
            websocket: ConnectionConfig::default(),
            rest: RestConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Override credentials with `BITVAVO_API_KEY` / `BITVAVO_API_SECRET`.
    pub fn apply_env(&mut self) {
        self.apply_credential_overrides(
            std::env::var(ENV_API_KEY).ok(),
            std::env::var(ENV_API_SECRET).ok(),
        );
    }

    /// Non-empty values replace the configured ones.
    pub fn apply_credential_overrides(&mut self, api_key: Option<String>, api_secret: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            self.credentials.api_key = Some(key);
        }
        if let Some(secret) = api_secret.filter(|s| !s.is_empty()) {
            self.credentials.api_secret = Some(secret);
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.to_credentials()
    }

    fn validate(&self) -> AppResult<()> {
        if self.markets.is_empty() {
            return Err(AppError::Config("at least one market is required".to_string()));
        }
        for market in &self.markets {
            market
                .parse::<Market>()
                .map_err(|e| AppError::Config(e.to_string()))?;
        }
        if self.metrics_interval_ms == 0 {
            return Err(AppError::Config("metrics_interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.markets, vec!["BTC-EUR"]);
        assert!(config.credentials().is_none());
        assert!(config.websocket.reconnect);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.metrics_interval_ms, 10_000);
        assert_eq!(config.websocket.reconnect_base_delay_ms, 100);
        assert_eq!(config.rest.timeout_ms, 30_000);
        assert_eq!(config.credentials.access_window_ms, 10_000);
    }

    #[test]
    fn test_full_toml() {
        let config = AppConfig::from_toml(
            r#"
            markets = ["BTC-EUR", "ETH-EUR"]
            candle_interval = "1m"
            ticker = true

            [websocket]
            url = "wss://example.invalid/v2/"
            max_reconnect_attempts = 5
            request_timeout_ms = 2000

            [credentials]
            api_key = "key"
            api_secret = "secret"
            access_window_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.markets.len(), 2);
        assert_eq!(config.candle_interval.as_deref(), Some("1m"));
        assert_eq!(config.websocket.max_reconnect_attempts, 5);
        assert_eq!(config.websocket.request_timeout_ms, Some(2000));
        let credentials = config.credentials().unwrap();
        assert_eq!(credentials.api_key(), "key");
        assert_eq!(credentials.access_window_ms(), 5000);
    }

    #[test]
    fn test_invalid_market_rejected() {
        let err = AppConfig::from_toml(r#"markets = ["BTCEUR"]"#).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(AppConfig::from_toml("markets = []").is_err());
    }

    #[test]
    fn test_credential_overrides() {
        let mut config = AppConfig::default();
        config.apply_credential_overrides(Some("env-key".to_string()), None);
        assert!(config.credentials().is_none());

        config.apply_credential_overrides(Some(String::new()), Some("env-secret".to_string()));
        assert_eq!(config.credentials().unwrap().api_key(), "env-key");
    }

    #[test]
    fn test_secret_not_serialized_or_logged() {
        let mut config = AppConfig::default();
        config.apply_credential_overrides(Some("k".to_string()), Some("hunter2".to_string()));

        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("markets"));
        assert!(!toml_str.contains("hunter2"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/default.toml");
        let config = AppConfig::from_file(path).unwrap();
        assert!(!config.markets.is_empty());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::from_file("does/not/exist.toml"),
            Err(AppError::Config(_))
        ));
    }
}
