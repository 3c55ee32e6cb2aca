//! Core types for the Bitvavo client.
//!
//! - `Price`, `Size`: exact decimal types matching the venue's string quotes
//! - `OrderBook`: snapshot + diff reconstruction with nonce gap detection
//! - `Credentials`: HMAC-SHA256 request signing
//! - `RateLimiter`: advisory rate budget shared by every transport

pub mod auth;
pub mod book;
pub mod decimal;
pub mod error;
pub mod market;
pub mod rate_limiter;

pub use auth::{create_signature, timestamp_ms, Credentials};
pub use book::{merge_levels, BookDiff, BookSide, BookSnapshot, Level, OrderBook};
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use market::Market;
pub use rate_limiter::{RateLimiter, DEFAULT_RATE_LIMIT, RATE_LIMIT_ERROR_CODE};
