//! Error types for bitvavo-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A book diff did not follow the last applied nonce.
    #[error("Nonce gap on {market}: expected {expected}, received {received}")]
    NonceGap {
        market: String,
        expected: u64,
        received: u64,
    },

    #[error("Invalid market: {0}")]
    InvalidMarket(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
