//! WebSocket connection manager.
//!
//! Handles connection lifecycle, authentication, automatic reconnection with
//! exponential backoff, and subscription replay after reconnection.

use crate::book_manager::BookManager;
use crate::client::WsClient;
use crate::error::{WsError, WsResult};
use crate::message::{Action, AuthenticateRequest, InboundFrame};
use crate::router::{Routed, Router};
use crate::subscription::{replay_frames_for, SubscriptionRegistry};
use crate::ws_write_handle::{WsOutbound, WsWriteHandle};
use bitvavo_core::{timestamp_ms, Credentials, RateLimiter};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Production WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://ws.bitvavo.com/v2/";

fn default_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_reconnect() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Reconnect after a session ends. When false, `connect()` returns the
    /// first transport error.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// Maximum consecutive reconnection attempts (0 = infinite).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Initial backoff delay.
    #[serde(default = "default_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Timeout for awaited requests. `None` waits until the reply or the
    /// session ends.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            reconnect: default_reconnect(),
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: default_base_delay_ms(),
            reconnect_max_delay_ms: default_max_delay_ms(),
            request_timeout_ms: None,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected and the server acknowledged `authenticate`.
    Authenticated,
    Reconnecting,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 5] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Connected,
        Self::Authenticated,
        Self::Reconnecting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Exponential reconnect backoff.
///
/// Starts at `initial`, doubles after every session that ended without
/// receiving a frame, capped at `max`. Reset to `initial` by the first
/// inbound frame of a session.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial = Duration::from_millis(initial_ms.min(max_ms));
        Self {
            initial,
            max: Duration::from_millis(max_ms),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay to wait now; doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug, Default)]
struct ConnectionStats {
    frames_received: AtomicU64,
    sessions_opened: AtomicU64,
    reconnects: AtomicU64,
    reconnect_delay_ms: AtomicU64,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub state: ConnectionState,
    pub frames_received: u64,
    pub sessions_opened: u64,
    pub reconnects: u64,
    /// Backoff applied before the most recent reconnect, 0 before the first.
    pub reconnect_delay_ms: u64,
    pub book_resyncs: u64,
    pub rate_limit_remaining: u32,
}

impl StatsSnapshot {
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// WebSocket connection manager.
///
/// Owns the socket, the subscription registry, the local books and the
/// rate tracker. [`ConnectionManager::connect`] runs sessions until
/// shutdown; consumers interact through [`ConnectionManager::client`].
pub struct ConnectionManager {
    config: ConnectionConfig,
    credentials: Option<Credentials>,
    state: Arc<RwLock<ConnectionState>>,
    registry: Arc<SubscriptionRegistry>,
    books: Arc<Mutex<BookManager>>,
    router: Arc<Router>,
    rate_limiter: Arc<RateLimiter>,
    stats: ConnectionStats,
    /// Outbound frame sender (for WsWriteHandle).
    outbound_tx: mpsc::UnboundedSender<WsOutbound>,
    /// Outbound frame receiver (consumed by the session loop).
    outbound_rx: TokioMutex<mpsc::UnboundedReceiver<WsOutbound>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl ConnectionManager {
    /// Create a connection manager with its own rate tracker.
    pub fn new(config: ConnectionConfig, credentials: Option<Credentials>) -> Self {
        Self::with_rate_limiter(config, credentials, Arc::new(RateLimiter::default()))
    }

    /// Create a connection manager sharing `rate_limiter` (e.g. with a REST client).
    pub fn with_rate_limiter(
        config: ConnectionConfig,
        credentials: Option<Credentials>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let credentials = credentials.filter(Credentials::is_configured);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let registry = Arc::new(SubscriptionRegistry::new());
        let books = Arc::new(Mutex::new(BookManager::new()));
        let handle = WsWriteHandle::new(outbound_tx.clone(), state.clone(), credentials.is_some());
        let router = Arc::new(Router::new(
            registry.clone(),
            books.clone(),
            rate_limiter.clone(),
            handle,
        ));
        Self {
            config,
            credentials,
            state,
            registry,
            books,
            router,
            rate_limiter,
            stats: ConnectionStats::default(),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a write handle for queuing frames.
    pub fn write_handle(&self) -> WsWriteHandle {
        WsWriteHandle::new(
            self.outbound_tx.clone(),
            self.state.clone(),
            self.credentials.is_some(),
        )
    }

    /// Consumer-facing client. Cheap to clone; valid across reconnects.
    pub fn client(&self) -> WsClient {
        WsClient::new(
            self.write_handle(),
            self.registry.clone(),
            self.books.clone(),
            self.router.clone(),
            self.rate_limiter.clone(),
            self.config.request_timeout_ms.map(Duration::from_millis),
        )
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state(),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            sessions_opened: self.stats.sessions_opened.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            reconnect_delay_ms: self.stats.reconnect_delay_ms.load(Ordering::Relaxed),
            book_resyncs: self.books.lock().resync_count(),
            rate_limit_remaining: self.rate_limiter.remaining(),
        }
    }

    /// Signal graceful shutdown.
    ///
    /// Closes the socket, stops reconnection and fails every pending request.
    pub fn shutdown(&self) {
        info!("ConnectionManager shutdown requested");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Connect and run sessions until shutdown.
    ///
    /// Returns `Ok(())` on shutdown. Returns the transport error when
    /// reconnection is disabled or the attempt limit is reached.
    pub async fn connect(&self) -> WsResult<()> {
        let mut backoff = Backoff::new(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
        );
        // Frames carried from one session to the next.
        let mut held: VecDeque<WsOutbound> = VecDeque::new();

        loop {
            if self.is_shutdown() {
                self.finish();
                return Ok(());
            }

            *self.state.write() = ConnectionState::Connecting;
            let result = self.run_session(&mut backoff, &mut held).await;
            *self.state.write() = ConnectionState::Disconnected;

            if self.is_shutdown() {
                info!("Shutdown requested, not reconnecting");
                self.finish();
                return Ok(());
            }

            self.settle_session(&mut held).await;

            let err = match result {
                Ok(()) => WsError::ConnectionClosed {
                    code: 1000,
                    reason: "session ended".to_string(),
                },
                Err(e) => e,
            };
            error!(error = %err, "WebSocket session ended");

            if !self.config.reconnect {
                return Err(err);
            }

            let max = self.config.max_reconnect_attempts;
            if max > 0 && backoff.attempts() >= max {
                error!(attempts = backoff.attempts(), "Max reconnection attempts reached");
                return Err(WsError::ConnectionFailed(format!(
                    "max reconnection attempts reached: {err}"
                )));
            }

            *self.state.write() = ConnectionState::Reconnecting;
            let delay = backoff.next_delay();
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            self.stats
                .reconnect_delay_ms
                .store(delay.as_millis() as u64, Ordering::Relaxed);
            warn!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            // Cancellation-aware sleep
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested during backoff, exiting");
                    self.finish();
                    return Ok(());
                }
            }
        }
    }

    fn finish(&self) {
        *self.state.write() = ConnectionState::Disconnected;
        self.router.fail_all_pending();
    }

    /// After a session ends: drop queued subscription frames (the next
    /// replay rebuilds them), keep requests, and fail requests whose frame
    /// already went out on the dead socket.
    async fn settle_session(&self, held: &mut VecDeque<WsOutbound>) {
        let mut outbound_rx = self.outbound_rx.lock().await;
        while let Ok(frame) = outbound_rx.try_recv() {
            held.push_back(frame);
        }
        held.retain(|frame| !frame.is_subscription());
        let unsent: HashSet<Action> = held.iter().filter_map(WsOutbound::action).collect();
        self.router.fail_pending_except(&unsent);
    }

    async fn run_session(
        &self,
        backoff: &mut Backoff,
        held: &mut VecDeque<WsOutbound>,
    ) -> WsResult<()> {
        info!(url = %self.config.url, "Connecting to WebSocket");

        let (ws_stream, _response) =
            connect_async_tls_with_config(&self.config.url, None, true, None).await?;
        let (mut write, mut read) = ws_stream.split();

        *self.state.write() = ConnectionState::Connected;
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        info!("WebSocket connected");

        let mut outbound_rx = self.outbound_rx.lock().await;
        let mut authenticated = false;

        if let Some(credentials) = &self.credentials {
            let frame = AuthenticateRequest::new(credentials, timestamp_ms()).to_frame()?;
            write.send(Message::Text(frame)).await?;
            debug!("Authenticate frame sent");
        }

        self.books.lock().reset_all();

        // Queued subscription frames are superseded by the replay. Taken
        // under the registry lock so no registration slips in between.
        let replay = self.registry.replay_with(|keys| {
            while let Ok(frame) = outbound_rx.try_recv() {
                if !frame.is_subscription() {
                    held.push_back(frame);
                }
            }
            replay_frames_for(keys)
        })?;

        info!(frames = replay.len(), "Replaying subscriptions");
        for (text, privileged) in replay {
            if privileged && !authenticated {
                held.push_back(WsOutbound::Subscription { text, privileged });
            } else {
                write.send(Message::Text(text)).await?;
            }
        }
        flush_held(&mut write, held, authenticated).await?;

        let mut received_any = false;

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in message loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                msg = read.next() => {
                    // A Close is the end of the session, not traffic.
                    if matches!(&msg, Some(Ok(m)) if !m.is_close()) && !received_any {
                        received_any = true;
                        backoff.reset();
                    }
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            if self.handle_text(&text) == Some(true) && !authenticated {
                                authenticated = true;
                                *self.state.write() = ConnectionState::Authenticated;
                                info!(held = held.len(), "Session authenticated");
                                flush_held(&mut write, held, authenticated).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("Received ping, sending pong");
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "WebSocket closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            error!(?e, "WebSocket read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return Err(WsError::ConnectionClosed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            });
                        }
                        _ => {}
                    }
                }

                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) if frame.is_privileged() && !authenticated => {
                            debug!("Holding privileged frame until authenticated");
                            held.push_back(frame);
                        }
                        Some(frame) => {
                            write.send(Message::Text(frame.into_text())).await?;
                        }
                        None => return Err(WsError::SendFailed("outbound channel closed".to_string())),
                    }
                }
            }
        }
    }

    /// Classify and route one text frame. Returns the authentication result
    /// when the frame was an `authenticated` ack.
    fn handle_text(&self, text: &str) -> Option<bool> {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Invalid JSON frame skipped");
                return None;
            }
        };
        match self.router.route(frame) {
            Routed::Authenticated(true) => Some(true),
            Routed::Authenticated(false) => {
                error!("Authentication rejected");
                Some(false)
            }
            _ => None,
        }
    }
}

/// Send held frames that may go out now; keep the rest in order.
async fn flush_held(
    write: &mut WsSink,
    held: &mut VecDeque<WsOutbound>,
    authenticated: bool,
) -> WsResult<()> {
    let mut keep = VecDeque::new();
    while let Some(frame) = held.pop_front() {
        if frame.is_privileged() && !authenticated {
            keep.push_back(frame);
            continue;
        }
        if let Err(e) = write.send(Message::Text(frame.text().to_string())).await {
            // Unsent frames stay held for the next session.
            held.push_front(frame);
            keep.append(held);
            *held = keep;
            return Err(e.into());
        }
    }
    *held = keep;
    Ok(())
}
