//! WebSocket session engine for the Bitvavo v2 API.
//!
//! Provides:
//! - Automatic reconnection with exponential backoff and subscription replay
//! - Session authentication with privileged frames held until the ack
//! - Frame classification and per-channel dispatch
//! - Local order books kept in sync by nonce-checked diffs
//! - Rate budget tracking shared with the REST client

pub mod book_manager;
pub mod client;
pub mod connection;
pub mod error;
pub mod message;
pub mod router;
pub mod subscription;
pub mod ws_write_handle;

pub use book_manager::{BookManager, BookUpdate};
pub use client::WsClient;
pub use connection::{
    Backoff, ConnectionConfig, ConnectionManager, ConnectionState, StatsSnapshot, DEFAULT_WS_URL,
};
pub use error::{WsError, WsResult};
pub use message::{
    AccountEvent, Action, ActionRequest, AuthenticateRequest, Candle, CandleEvent, ChannelSpec,
    ErrorFrame, FillEvent, InboundFrame, OrderEvent, SubscriptionRequest, Ticker24hEntry,
    TickerEvent, TradeEvent,
};
pub use bitvavo_core::{RateLimiter, DEFAULT_RATE_LIMIT, RATE_LIMIT_ERROR_CODE};
pub use router::{Routed, Router};
pub use subscription::{Callback, Channel, Handler, SubscriptionKey, SubscriptionRegistry};
pub use ws_write_handle::{SendError, WsOutbound, WsWriteHandle};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
