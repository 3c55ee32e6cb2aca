//! REST error types.

use bitvavo_core::RATE_LIMIT_ERROR_CODE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// `{error, errorCode}` body returned by the API.
    #[error("API error {code:?}: {message}")]
    Api { code: Option<i64>, message: String },

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for RestError {
    fn from(e: reqwest::Error) -> Self {
        Self::HttpClient(e.to_string())
    }
}

impl RestError {
    /// Rate-limit ban.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Api { code: Some(code), .. } if *code == RATE_LIMIT_ERROR_CODE)
    }
}

pub type RestResult<T> = Result<T, RestError>;
