//! Main application orchestration.
//!
//! One WebSocket session and one REST client share a rate tracker. The
//! session runs on its own task; the main loop publishes metrics until the
//! shutdown future resolves.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use bitvavo_core::{OrderBook, Size};
use bitvavo_rest::RestClient;
use bitvavo_telemetry::MetricsPublisher;
use bitvavo_ws::{
    AccountEvent, CandleEvent, ConnectionManager, ErrorFrame, RateLimiter, TickerEvent, WsClient,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Levels per side summed into the logged book depth.
const LOG_DEPTH: usize = 10;

/// How long shutdown waits for the session task to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Main application.
pub struct Application {
    config: AppConfig,
    manager: Arc<ConnectionManager>,
    rest: RestClient,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let credentials = config.credentials();
        let rate_limiter = Arc::new(RateLimiter::default());

        let manager = Arc::new(ConnectionManager::with_rate_limiter(
            config.websocket.clone(),
            credentials.clone(),
            rate_limiter.clone(),
        ));
        let rest = RestClient::new(config.rest.clone(), credentials, rate_limiter)?;

        info!(
            markets = ?config.markets,
            authenticated = rest.has_credentials(),
            "Application initialized"
        );

        Ok(Self {
            config,
            manager,
            rest,
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> AppResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(?e, "Failed to listen for Ctrl-C");
            }
        })
        .await
    }

    /// Run until `shutdown` resolves or the session gives up.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> AppResult<()> {
        self.check_server_time().await;

        let client = self.manager.client();
        self.subscribe_all(&client)?;

        let manager = self.manager.clone();
        let mut ws_task = tokio::spawn(async move { manager.connect().await });

        let mut publisher = MetricsPublisher::new();
        let mut metrics_interval =
            tokio::time::interval(Duration::from_millis(self.config.metrics_interval_ms));
        tokio::pin!(shutdown);

        info!("Entering main event loop");
        let outcome = loop {
            tokio::select! {
                _ = metrics_interval.tick() => {
                    let stats = self.manager.stats();
                    debug!(
                        state = ?stats.state,
                        frames = stats.frames_received,
                        reconnects = stats.reconnects,
                        reconnect_delay_ms = stats.reconnect_delay_ms,
                        resyncs = stats.book_resyncs,
                        rate_limit_remaining = stats.rate_limit_remaining,
                        "Connection stats"
                    );
                    publisher.publish(stats);
                }

                result = &mut ws_task => {
                    break match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => {
                            error!(?e, "WebSocket session gave up");
                            Err(AppError::from(e))
                        }
                        Err(e) => Err(AppError::Task(e.to_string())),
                    };
                }

                () = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.manager.shutdown();
                    if tokio::time::timeout(SHUTDOWN_GRACE, &mut ws_task).await.is_err() {
                        warn!("Session task did not stop in time, aborting");
                        ws_task.abort();
                    }
                    break Ok(());
                }
            }
        };

        publisher.publish(self.manager.stats());
        info!(subscriptions = client.subscription_count(), "Shut down");
        outcome
    }

    /// Log the local clock offset. Failures are not fatal.
    async fn check_server_time(&self) {
        match self.rest.time().await {
            Ok(server_ms) => {
                let offset_ms = bitvavo_core::timestamp_ms() - server_ms;
                if offset_ms.unsigned_abs() > 1_000 {
                    warn!(offset_ms, "Local clock differs from server time");
                } else {
                    info!(offset_ms, "Server time checked");
                }
            }
            Err(e) => warn!(error = %e, "Server time check failed"),
        }
    }

    fn subscribe_all(&self, client: &WsClient) -> AppResult<()> {
        client.on_error(|frame: &ErrorFrame| {
            warn!(code = ?frame.code, message = %frame.message, action = ?frame.action, "Server error");
        });

        for market in &self.config.markets {
            client.subscribe_book(market, log_book)?;

            if self.config.ticker {
                client.subscribe_ticker(market, |ticker: &TickerEvent| {
                    debug!(market = %ticker.market, ?ticker.best_bid, ?ticker.best_ask, "Ticker");
                })?;
            }

            if let Some(interval) = &self.config.candle_interval {
                client.subscribe_candles(market, interval, |event: &CandleEvent| {
                    for candle in &event.candle {
                        info!(market = %event.market, interval = %event.interval, close = %candle.close, volume = %candle.volume, "Candle");
                    }
                })?;
            }

            if self.rest.has_credentials() {
                client.subscribe_account(market, log_account_event)?;
            }
        }
        Ok(())
    }
}

fn log_book(book: &OrderBook) {
    let (bids, asks) = book.depth(LOG_DEPTH);
    let bid_size = bids.iter().fold(Size::default(), |acc, l| acc + l.size);
    let ask_size = asks.iter().fold(Size::default(), |acc, l| acc + l.size);

    match (book.best_bid(), book.best_ask()) {
        (Some(bid), Some(ask)) => debug!(
            market = %book.market,
            nonce = book.nonce,
            bid = %bid.price,
            ask = %ask.price,
            mid = ?book.mid_price(),
            spread_bps = ?ask.price.bps_from(bid.price),
            %bid_size,
            %ask_size,
            "Book"
        ),
        _ => debug!(market = %book.market, nonce = book.nonce, "Book has an empty side"),
    }
}

fn log_account_event(event: &AccountEvent) {
    match event {
        AccountEvent::Order(order) => info!(
            market = %order.market,
            order_id = %order.order_id,
            status = ?order.status,
            "Order update"
        ),
        AccountEvent::Fill(fill) => info!(
            market = %fill.market,
            order_id = %fill.order_id,
            price = %fill.price,
            amount = %fill.amount,
            side = %fill.side,
            "Fill"
        ),
    }
}
