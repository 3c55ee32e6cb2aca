//! Prometheus metrics for the streaming client.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a startup bug.

use bitvavo_ws::{ConnectionState, StatsSnapshot};
use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter, register_int_gauge, Encoder,
    Gauge, GaugeVec, IntCounter, IntGauge, TextEncoder,
};

use crate::error::TelemetryResult;

/// WebSocket connection state (1 = connected, 0 = disconnected).
pub static WS_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "bitvavo_ws_connected",
        "WebSocket connection state (1=connected)"
    )
    .unwrap()
});

/// Labels: state (disconnected/connecting/connected/authenticated/reconnecting)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "bitvavo_ws_state",
        "WebSocket state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

pub static WS_RECONNECT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "bitvavo_ws_reconnect_total",
        "Total WebSocket reconnection attempts"
    )
    .unwrap()
});

pub static WS_FRAMES_RECEIVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "bitvavo_ws_frames_received_total",
        "Total inbound WebSocket text frames"
    )
    .unwrap()
});

/// Resyncs triggered by a nonce gap.
pub static BOOK_RESYNC_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "bitvavo_book_resync_total",
        "Total local order book resyncs"
    )
    .unwrap()
});

pub static RATE_LIMIT_REMAINING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "bitvavo_rate_limit_remaining",
        "Remaining API weight in the current rate-limit window"
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Only the active state is 1.
    pub fn ws_state_set(state: ConnectionState) {
        for s in ConnectionState::ALL {
            WS_STATE.with_label_values(&[s.as_str()]).set(0.0);
        }
        WS_STATE.with_label_values(&[state.as_str()]).set(1.0);
    }

    pub fn ws_connected(connected: bool) {
        WS_CONNECTED.set(if connected { 1.0 } else { 0.0 });
    }

    pub fn rate_limit_remaining(remaining: u32) {
        RATE_LIMIT_REMAINING.set(i64::from(remaining));
    }

    /// Render the default registry in the text exposition format.
    pub fn encode_text() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Converts cumulative [`StatsSnapshot`] totals into counter increments.
#[derive(Debug, Default)]
pub struct MetricsPublisher {
    last: Option<StatsSnapshot>,
}

impl MetricsPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, stats: StatsSnapshot) {
        let (reconnects, frames, resyncs) = match &self.last {
            Some(prev) => (
                stats.reconnects.saturating_sub(prev.reconnects),
                stats.frames_received.saturating_sub(prev.frames_received),
                stats.book_resyncs.saturating_sub(prev.book_resyncs),
            ),
            None => (stats.reconnects, stats.frames_received, stats.book_resyncs),
        };
        WS_RECONNECT_TOTAL.inc_by(reconnects);
        WS_FRAMES_RECEIVED_TOTAL.inc_by(frames);
        BOOK_RESYNC_TOTAL.inc_by(resyncs);

        Metrics::ws_connected(stats.is_connected());
        Metrics::ws_state_set(stats.state);
        Metrics::rate_limit_remaining(stats.rate_limit_remaining);

        self.last = Some(stats);
    }
}
