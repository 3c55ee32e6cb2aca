//! Signed HTTP client for the Bitvavo v2 REST API.
//!
//! One [`RestClient::perform_request`] does the transport work; the endpoint
//! methods only shape paths, query options and bodies.

use crate::error::{RestError, RestResult};
use crate::query::{create_postfix, Options};
use bitvavo_core::{timestamp_ms, BookSnapshot, Credentials, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Production REST base URL.
pub const DEFAULT_REST_URL: &str = "https://api.bitvavo.com/v2";

const HEADER_ACCESS_KEY: &str = "bitvavo-access-key";
const HEADER_ACCESS_SIGNATURE: &str = "bitvavo-access-signature";
const HEADER_ACCESS_TIMESTAMP: &str = "bitvavo-access-timestamp";
const HEADER_ACCESS_WINDOW: &str = "bitvavo-access-window";
const HEADER_RATELIMIT_REMAINING: &str = "bitvavo-ratelimit-remaining";
const HEADER_RATELIMIT_RESET_AT: &str = "bitvavo-ratelimit-resetat";

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// REST client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Base URL including the `/v2` prefix.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String {
    DEFAULT_REST_URL.to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Signed REST client.
///
/// Shares its [`RateLimiter`] with the WebSocket session so both transports
/// report one budget.
pub struct RestClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    rate_limiter: Arc<RateLimiter>,
    clock: Clock,
}

impl RestClient {
    pub fn new(
        config: RestConfig,
        credentials: Option<Credentials>,
        rate_limiter: Arc<RateLimiter>,
    ) -> RestResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RestError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: credentials.filter(Credentials::is_configured),
            rate_limiter,
            clock: Arc::new(timestamp_ms),
        })
    }

    /// Replace the timestamp source used for signing.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Remaining request budget.
    pub fn remaining_limit(&self) -> u32 {
        self.rate_limiter.remaining()
    }

    /// Send one request and return the decoded JSON body.
    ///
    /// Signs when credentials are configured. `path` is relative to the base
    /// URL (e.g. `/order`); the encoded `options` are appended as the query
    /// string and are part of the signed path.
    pub async fn perform_request(
        &self,
        method: Method,
        path: &str,
        options: &Options,
        body: Option<&Value>,
    ) -> RestResult<Value> {
        let signed_path = format!("{path}{}", create_postfix(options));
        let url = format!("{}{signed_path}", self.base_url);
        let body_text = match body {
            Some(Value::Object(map)) if map.is_empty() => None,
            Some(Value::Null) | None => None,
            Some(value) => Some(serde_json::to_string(value)?),
        };

        let mut request = self.http.request(method.clone(), &url);
        if let Some(credentials) = &self.credentials {
            request = request.headers(self.auth_headers(
                credentials,
                method.as_str(),
                &signed_path,
                body_text.as_deref(),
            )?);
        }
        if let Some(text) = body_text {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(text);
        }

        debug!(%method, path = %signed_path, "REST request");
        let response = request.send().await?;
        let status = response.status();
        self.observe_rate_headers(response.headers());

        let text = response.text().await?;
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) if !status.is_success() => {
                return Err(RestError::Status {
                    status: status.as_u16(),
                    body: text,
                })
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(message) = value.get("error") {
            let code = value.get("errorCode").and_then(Value::as_i64);
            let message = message
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| message.to_string());
            self.rate_limiter.observe_error(code, &message);
            warn!(?code, %message, path = %signed_path, "REST API error");
            return Err(RestError::Api { code, message });
        }
        if !status.is_success() {
            return Err(RestError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(value)
    }

    fn auth_headers(
        &self,
        credentials: &Credentials,
        method: &str,
        signed_path: &str,
        body: Option<&str>,
    ) -> RestResult<HeaderMap> {
        let timestamp = (self.clock)();
        let signature = credentials.sign(timestamp, method, signed_path, body);

        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: String| -> RestResult<()> {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| RestError::HttpClient(format!("invalid {name} header: {e}")))?;
            headers.insert(name, value);
            Ok(())
        };
        insert(HEADER_ACCESS_KEY, credentials.api_key().to_string())?;
        insert(HEADER_ACCESS_SIGNATURE, signature)?;
        insert(HEADER_ACCESS_TIMESTAMP, timestamp.to_string())?;
        insert(HEADER_ACCESS_WINDOW, credentials.access_window_ms().to_string())?;
        Ok(headers)
    }

    fn observe_rate_headers(&self, headers: &HeaderMap) {
        let read = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let remaining = read(HEADER_RATELIMIT_REMAINING).and_then(|v| v.parse::<u32>().ok());
        let reset_at = read(HEADER_RATELIMIT_RESET_AT).and_then(|v| v.parse::<i64>().ok());
        if remaining.is_some() || reset_at.is_some() {
            self.rate_limiter.observe_headers(remaining, reset_at);
        }
    }

    async fn public_get(&self, path: &str, options: &Options) -> RestResult<Value> {
        self.perform_request(Method::GET, path, options, None).await
    }

    async fn private(
        &self,
        method: Method,
        path: &str,
        options: &Options,
        body: Option<&Value>,
    ) -> RestResult<Value> {
        if self.credentials.is_none() {
            return Err(RestError::MissingCredentials(format!(
                "{method} {path} requires an API key and secret"
            )));
        }
        self.perform_request(method, path, options, body).await
    }

    // ------------------------------------------------------------------------
    // Public endpoints
    // ------------------------------------------------------------------------

    /// Server time in ms.
    pub async fn time(&self) -> RestResult<i64> {
        let response = self.public_get("/time", &Options::new()).await?;
        response
            .get("time")
            .and_then(Value::as_i64)
            .ok_or_else(|| RestError::InvalidResponse(format!("time missing in {response}")))
    }

    /// Options: `market`.
    pub async fn markets(&self, options: Options) -> RestResult<Value> {
        self.public_get("/markets", &options).await
    }

    /// Options: `symbol`.
    pub async fn assets(&self, options: Options) -> RestResult<Value> {
        self.public_get("/assets", &options).await
    }

    /// Options: `depth`.
    pub async fn book(&self, market: &str, options: Options) -> RestResult<BookSnapshot> {
        let response = self.public_get(&format!("/{market}/book"), &options).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Options: `limit`, `start`, `end`, `tradeIdFrom`, `tradeIdTo`.
    pub async fn public_trades(&self, market: &str, options: Options) -> RestResult<Value> {
        self.public_get(&format!("/{market}/trades"), &options).await
    }

    /// Options: `limit`, `start`, `end`.
    pub async fn candles(
        &self,
        market: &str,
        interval: &str,
        mut options: Options,
    ) -> RestResult<Value> {
        options.insert("interval".to_string(), Value::from(interval));
        self.public_get(&format!("/{market}/candles"), &options).await
    }

    /// Options: `market`.
    pub async fn ticker_price(&self, options: Options) -> RestResult<Value> {
        self.public_get("/ticker/price", &options).await
    }

    /// Options: `market`.
    pub async fn ticker_book(&self, options: Options) -> RestResult<Value> {
        self.public_get("/ticker/book", &options).await
    }

    /// Options: `market`.
    pub async fn ticker_24h(&self, options: Options) -> RestResult<Value> {
        self.public_get("/ticker/24h", &options).await
    }

    // ------------------------------------------------------------------------
    // Private endpoints
    // ------------------------------------------------------------------------

    /// Place an order. `body` carries the order-type specific fields
    /// (`amount`, `price`, `timeInForce`, ...).
    pub async fn place_order(
        &self,
        market: &str,
        side: &str,
        order_type: &str,
        mut body: Options,
    ) -> RestResult<Value> {
        body.insert("market".to_string(), Value::from(market));
        body.insert("side".to_string(), Value::from(side));
        body.insert("orderType".to_string(), Value::from(order_type));
        self.private(Method::POST, "/order", &Options::new(), Some(&Value::Object(body)))
            .await
    }

    pub async fn get_order(&self, market: &str, order_id: &str) -> RestResult<Value> {
        self.private(Method::GET, "/order", &order_key(market, order_id), None)
            .await
    }

    pub async fn update_order(
        &self,
        market: &str,
        order_id: &str,
        mut body: Options,
    ) -> RestResult<Value> {
        body.insert("market".to_string(), Value::from(market));
        body.insert("orderId".to_string(), Value::from(order_id));
        self.private(Method::PUT, "/order", &Options::new(), Some(&Value::Object(body)))
            .await
    }

    pub async fn cancel_order(&self, market: &str, order_id: &str) -> RestResult<Value> {
        self.private(Method::DELETE, "/order", &order_key(market, order_id), None)
            .await
    }

    /// Options: `orderIdFrom`, `orderIdTo`, `limit`, `start`, `end`.
    pub async fn get_orders(&self, market: &str, mut options: Options) -> RestResult<Value> {
        options.insert("market".to_string(), Value::from(market));
        self.private(Method::GET, "/orders", &options, None).await
    }

    /// Options: `market`.
    pub async fn cancel_orders(&self, options: Options) -> RestResult<Value> {
        self.private(Method::DELETE, "/orders", &options, None).await
    }

    /// Options: `market`.
    pub async fn orders_open(&self, options: Options) -> RestResult<Value> {
        self.private(Method::GET, "/ordersOpen", &options, None).await
    }

    /// Options: `limit`, `start`, `end`, `tradeIdFrom`, `tradeIdTo`.
    pub async fn trades(&self, market: &str, mut options: Options) -> RestResult<Value> {
        options.insert("market".to_string(), Value::from(market));
        self.private(Method::GET, "/trades", &options, None).await
    }

    pub async fn account(&self) -> RestResult<Value> {
        self.private(Method::GET, "/account", &Options::new(), None)
            .await
    }

    /// Options: `symbol`.
    pub async fn balance(&self, options: Options) -> RestResult<Value> {
        self.private(Method::GET, "/balance", &options, None).await
    }

    /// Fee tier. Options: `market`.
    pub async fn fees(&self, options: Options) -> RestResult<Value> {
        self.private(Method::GET, "/account/fees", &options, None)
            .await
    }

    pub async fn deposit_assets(&self, symbol: &str) -> RestResult<Value> {
        let mut options = Options::new();
        options.insert("symbol".to_string(), Value::from(symbol));
        self.private(Method::GET, "/deposit", &options, None).await
    }

    /// Optional body fields: `paymentId`, `internal`, `addWithdrawalFee`.
    pub async fn withdraw_assets(
        &self,
        symbol: &str,
        amount: &str,
        address: &str,
        mut body: Options,
    ) -> RestResult<Value> {
        body.insert("symbol".to_string(), Value::from(symbol));
        body.insert("amount".to_string(), Value::from(amount));
        body.insert("address".to_string(), Value::from(address));
        self.private(
            Method::POST,
            "/withdrawal",
            &Options::new(),
            Some(&Value::Object(body)),
        )
        .await
    }

    /// Options: `symbol`, `limit`, `start`, `end`.
    pub async fn deposit_history(&self, options: Options) -> RestResult<Value> {
        self.private(Method::GET, "/depositHistory", &options, None)
            .await
    }

    /// Options: `symbol`, `limit`, `start`, `end`.
    pub async fn withdrawal_history(&self, options: Options) -> RestResult<Value> {
        self.private(Method::GET, "/withdrawalHistory", &options, None)
            .await
    }
}

fn order_key(market: &str, order_id: &str) -> Options {
    let mut options = Options::new();
    options.insert("market".to_string(), Value::from(market));
    options.insert("orderId".to_string(), Value::from(order_id));
    options
}
