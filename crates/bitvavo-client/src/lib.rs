//! Streaming market-data client for the Bitvavo v2 API.
//!
//! Wires the WebSocket session, the REST client and telemetry together:
//! - Local order books per configured market
//! - Optional ticker and candle streams
//! - Account stream when credentials are configured
//! - Periodic metrics publication

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
