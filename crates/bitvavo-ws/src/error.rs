//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Message parse error: {0}")]
    ParseError(String),

    /// Server-sent `error` frame.
    #[error("Protocol error {code:?}: {message}")]
    Protocol { code: Option<i64>, message: String },

    /// Private action requested without API credentials.
    #[error("API key not configured for private action {0}")]
    MissingCredentials(String),

    #[error("Request {0} timed out")]
    Timeout(String),

    /// The session ended before the reply arrived.
    #[error("Request {0} aborted")]
    RequestAborted(String),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WsResult<T> = Result<T, WsError>;
