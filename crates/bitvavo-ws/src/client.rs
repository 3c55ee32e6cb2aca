//! Consumer-facing WebSocket client.
//!
//! Obtained from [`crate::ConnectionManager::client`]. Every method only
//! queues frames, so the client can be used before the first session opens
//! and across reconnects.

use crate::book_manager::BookManager;
use crate::error::{WsError, WsResult};
use crate::message::{
    AccountEvent, Action, ActionRequest, CandleEvent, ErrorFrame, Ticker24hEntry, TickerEvent,
    TradeEvent,
};
use crate::router::Router;
use crate::subscription::{Channel, Handler, SubscriptionKey, SubscriptionRegistry};
use crate::ws_write_handle::WsWriteHandle;
use bitvavo_core::{BookDiff, BookSnapshot, OrderBook, RateLimiter};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error};

/// Handle for subscribing, sending and awaiting requests.
#[derive(Clone)]
pub struct WsClient {
    handle: WsWriteHandle,
    registry: Arc<SubscriptionRegistry>,
    books: Arc<Mutex<BookManager>>,
    router: Arc<Router>,
    rate_limiter: Arc<RateLimiter>,
    /// One outstanding awaited request per action.
    request_locks: Arc<DashMap<Action, Arc<TokioMutex<()>>>>,
    request_timeout: Option<Duration>,
}

impl WsClient {
    pub(crate) fn new(
        handle: WsWriteHandle,
        registry: Arc<SubscriptionRegistry>,
        books: Arc<Mutex<BookManager>>,
        router: Arc<Router>,
        rate_limiter: Arc<RateLimiter>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            handle,
            registry,
            books,
            router,
            rate_limiter,
            request_locks: Arc::new(DashMap::new()),
            request_timeout,
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    pub fn subscribe_ticker(
        &self,
        market: &str,
        callback: impl Fn(&TickerEvent) + Send + Sync + 'static,
    ) -> WsResult<()> {
        self.subscribe(
            SubscriptionKey::new(Channel::Ticker, market),
            Handler::Ticker(Arc::new(callback)),
        )
    }

    pub fn subscribe_ticker24h(
        &self,
        market: &str,
        callback: impl Fn(&Ticker24hEntry) + Send + Sync + 'static,
    ) -> WsResult<()> {
        self.subscribe(
            SubscriptionKey::new(Channel::Ticker24h, market),
            Handler::Ticker24h(Arc::new(callback)),
        )
    }

    pub fn subscribe_trades(
        &self,
        market: &str,
        callback: impl Fn(&TradeEvent) + Send + Sync + 'static,
    ) -> WsResult<()> {
        self.subscribe(
            SubscriptionKey::new(Channel::Trades, market),
            Handler::Trades(Arc::new(callback)),
        )
    }

    pub fn subscribe_candles(
        &self,
        market: &str,
        interval: &str,
        callback: impl Fn(&CandleEvent) + Send + Sync + 'static,
    ) -> WsResult<()> {
        self.subscribe(
            SubscriptionKey::candles(market, interval),
            Handler::Candles(Arc::new(callback)),
        )
    }

    /// Raw book diffs, without local reconstruction.
    pub fn subscribe_book_updates(
        &self,
        market: &str,
        callback: impl Fn(&BookDiff) + Send + Sync + 'static,
    ) -> WsResult<()> {
        self.subscribe(
            SubscriptionKey::new(Channel::BookUpdates, market),
            Handler::BookUpdates(Arc::new(callback)),
        )
    }

    /// Locally maintained order book. The callback receives the full book
    /// after every snapshot and every applied diff.
    pub fn subscribe_book(
        &self,
        market: &str,
        callback: impl Fn(&OrderBook) + Send + Sync + 'static,
    ) -> WsResult<()> {
        self.subscribe(
            SubscriptionKey::new(Channel::Book, market),
            Handler::Book(Arc::new(callback)),
        )
    }

    /// Own orders and fills. Requires credentials.
    pub fn subscribe_account(
        &self,
        market: &str,
        callback: impl Fn(&AccountEvent) + Send + Sync + 'static,
    ) -> WsResult<()> {
        self.subscribe(
            SubscriptionKey::new(Channel::Account, market),
            Handler::Account(Arc::new(callback)),
        )
    }

    fn subscribe(&self, key: SubscriptionKey, handler: Handler) -> WsResult<()> {
        let privileged = key.channel.is_private();
        if privileged && !self.handle.has_credentials() {
            error!(subscription = %key, "API key not configured, subscription not registered");
            return Err(WsError::MissingCredentials(key.to_string()));
        }

        let frames = key.subscribe_frames()?;
        self.registry.register_with(key, handler, |key| {
            let newly_tracked = key.channel == Channel::Book && {
                let mut books = self.books.lock();
                let known = books.is_tracked(&key.market);
                books.track(&key.market);
                !known
            };
            for frame in frames {
                if let Err(e) = self.handle.send_subscription(frame, privileged) {
                    if newly_tracked {
                        self.books.lock().untrack(&key.market);
                    }
                    return Err(WsError::from(e));
                }
            }
            Ok(())
        })
    }

    /// Remove every subscription of `channel` for `market` (all candle
    /// intervals). The wire unsubscribe is only sent when no other entry
    /// still needs the same server channel.
    pub fn unsubscribe(&self, market: &str, channel: Channel) -> WsResult<()> {
        let privileged = channel.is_private();
        self.registry
            .unregister_market_channel(channel, market, |removed, wire_still_used| {
                if channel == Channel::Book {
                    self.books.lock().untrack(market);
                }
                if removed.is_empty() {
                    debug!(%market, %channel, "Nothing to unsubscribe");
                    return Ok(());
                }
                if wire_still_used {
                    return Ok(());
                }
                for key in removed {
                    self.handle
                        .send_subscription(key.unsubscribe_frame()?, privileged)?;
                }
                Ok(())
            })
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Called for every server error frame.
    pub fn on_error(&self, callback: impl Fn(&ErrorFrame) + Send + Sync + 'static) {
        self.router.add_error_listener(Arc::new(callback));
    }

    /// Called for every reply to `action`.
    pub fn on_response(
        &self,
        action: Action,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        self.router.add_response_listener(action, Arc::new(callback));
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Fire-and-forget. Replies go to [`Self::on_response`] listeners.
    ///
    /// A private action without credentials is logged and dropped.
    pub fn send(&self, request: ActionRequest) -> WsResult<()> {
        let action = request.action;
        if action.is_private() && !self.handle.has_credentials() {
            error!(action = %action, "API key not configured, private request dropped");
            return Ok(());
        }
        self.handle.send_request(action, request.to_frame()?)?;
        Ok(())
    }

    /// Send and await the reply.
    ///
    /// Requests are serialized per action so each reply maps to exactly one
    /// caller. A server error for the action fails the request.
    pub async fn request(&self, request: ActionRequest) -> WsResult<Value> {
        let action = request.action;
        if action.is_private() && !self.handle.has_credentials() {
            return Err(WsError::MissingCredentials(action.to_string()));
        }
        let frame = request.to_frame()?;
        let market = match action {
            Action::GetBook => request.market().map(String::from),
            _ => None,
        };

        let lock = self
            .request_locks
            .entry(action)
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let rx = self.router.register_pending(action, market);
        if let Err(e) = self.handle.send_request(action, frame) {
            self.router.cancel_pending(action);
            return Err(e.into());
        }

        let reply = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.router.cancel_pending(action);
                    return Err(WsError::Timeout(action.to_string()));
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(frame)) => Err(frame.into()),
            Err(_) => Err(WsError::RequestAborted(action.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Typed helpers
    // ------------------------------------------------------------------------

    /// Server time in ms.
    pub async fn time(&self) -> WsResult<i64> {
        let response = self.request(ActionRequest::new(Action::GetTime)).await?;
        response
            .get("time")
            .and_then(Value::as_i64)
            .ok_or_else(|| WsError::ParseError(format!("time missing in {response}")))
    }

    pub async fn markets(&self, market: Option<&str>) -> WsResult<Value> {
        self.request(ActionRequest::new(Action::GetMarkets).with_opt("market", market))
            .await
    }

    /// One-off book snapshot.
    pub async fn book(&self, market: &str, depth: Option<u32>) -> WsResult<BookSnapshot> {
        let response = self
            .request(
                ActionRequest::new(Action::GetBook)
                    .with("market", market)
                    .with_opt("depth", depth),
            )
            .await?;
        Ok(BookSnapshot::deserialize(&response)?)
    }

    /// `body` carries the order parameters beyond market, side and type
    /// (amount, price, timeInForce, ...).
    pub async fn place_order(
        &self,
        market: &str,
        side: &str,
        order_type: &str,
        body: Map<String, Value>,
    ) -> WsResult<Value> {
        self.request(
            ActionRequest::new(Action::PrivateCreateOrder)
                .with("market", market)
                .with("side", side)
                .with("orderType", order_type)
                .with_body(body),
        )
        .await
    }

    pub async fn get_order(&self, market: &str, order_id: &str) -> WsResult<Value> {
        self.request(
            ActionRequest::new(Action::PrivateGetOrder)
                .with("market", market)
                .with("orderId", order_id),
        )
        .await
    }

    pub async fn cancel_order(&self, market: &str, order_id: &str) -> WsResult<Value> {
        self.request(
            ActionRequest::new(Action::PrivateCancelOrder)
                .with("market", market)
                .with("orderId", order_id),
        )
        .await
    }

    pub async fn orders_open(&self, market: Option<&str>) -> WsResult<Value> {
        self.request(ActionRequest::new(Action::PrivateGetOrdersOpen).with_opt("market", market))
            .await
    }

    pub async fn balance(&self, symbol: Option<&str>) -> WsResult<Value> {
        self.request(ActionRequest::new(Action::PrivateGetBalance).with_opt("symbol", symbol))
            .await
    }

    pub async fn account(&self) -> WsResult<Value> {
        self.request(ActionRequest::new(Action::PrivateGetAccount))
            .await
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Remaining rate budget as last reported by the server.
    pub fn remaining_limit(&self) -> u32 {
        self.rate_limiter.remaining()
    }

    /// Current local copy of `market`'s book, if tracked and synced.
    pub fn book_snapshot(&self, market: &str) -> Option<OrderBook> {
        self.books.lock().book(market).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }
}
