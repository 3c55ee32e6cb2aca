//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<bitvavo_ws::WsError>),

    #[error("REST error: {0}")]
    Rest(#[from] bitvavo_rest::RestError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] bitvavo_telemetry::TelemetryError),

    #[error("Task error: {0}")]
    Task(String),
}

impl From<bitvavo_ws::WsError> for AppError {
    fn from(e: bitvavo_ws::WsError) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

pub type AppResult<T> = Result<T, AppError>;
