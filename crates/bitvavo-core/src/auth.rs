//! Request signing.
//!
//! Every private REST call and the WebSocket `authenticate` frame carry an
//! HMAC-SHA256 proof over `timestamp ‖ method ‖ "/v2" ‖ path ‖ body`,
//! keyed by the API secret and rendered as lowercase hex.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Path prefix included in every signed message.
pub const API_VERSION_PREFIX: &str = "/v2";

/// Path signed by the WebSocket `authenticate` frame.
pub const WEBSOCKET_AUTH_PATH: &str = "/websocket";

/// Default tolerance (ms) between request timestamp and server receipt.
pub const DEFAULT_ACCESS_WINDOW_MS: u64 = 10_000;

/// Compute the signature for one request.
///
/// `path` includes the query string when there is one. `body` is the exact
/// serialized JSON that will be sent, or `None` for an empty body.
pub fn create_signature(
    secret: &str,
    timestamp_ms: i64,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(method.as_bytes());
    mac.update(API_VERSION_PREFIX.as_bytes());
    mac.update(path.as_bytes());
    if let Some(body) = body.filter(|b| !b.is_empty()) {
        mac.update(body.as_bytes());
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Current time in milliseconds since the epoch.
pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// API key pair plus access window.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: Zeroizing<String>,
    access_window_ms: u64,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: Zeroizing::new(api_secret.into()),
            access_window_ms: DEFAULT_ACCESS_WINDOW_MS,
        }
    }

    pub fn with_access_window(mut self, access_window_ms: u64) -> Self {
        self.access_window_ms = access_window_ms;
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn access_window_ms(&self) -> u64 {
        self.access_window_ms
    }

    /// True when both key and secret are set.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// Sign one request with these credentials.
    pub fn sign(&self, timestamp_ms: i64, method: &str, path: &str, body: Option<&str>) -> String {
        create_signature(&self.api_secret, timestamp_ms, method, path, body)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("access_window_ms", &self.access_window_ms)
            .finish()
    }
}
