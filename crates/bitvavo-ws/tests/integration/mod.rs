//! Integration tests for bitvavo-ws.
//!
//! These tests run the session engine against a local WebSocket server:
//! - Subscription replay across reconnects
//! - Authentication hold for private frames
//! - Order book snapshot, diff and resync flow

pub mod common;
