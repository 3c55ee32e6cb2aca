//! REST transport for the Bitvavo v2 API.
//!
//! Every request can be signed with the same HMAC scheme as the WebSocket
//! `authenticate` frame. Rate-limit headers and `errorCode` 105 bodies feed
//! the [`RateLimiter`](bitvavo_core::RateLimiter) shared with the socket.

pub mod client;
pub mod error;
pub mod query;

pub use client::{RestClient, RestConfig, DEFAULT_REST_URL};
pub use error::{RestError, RestResult};
pub use query::{create_postfix, Options};
