//! Inbound frame dispatch.
//!
//! Frames arrive in order on the session task and are routed one at a time:
//! errors to the rate tracker, error listeners and the failing request;
//! action replies to the awaiting request, response listeners and (for
//! `getBook`) the local books; events to the registered subscription.

use crate::book_manager::{BookManager, BookUpdate};
use crate::message::{
    AccountEvent, Action, CandleEvent, ErrorFrame, FillEvent, InboundFrame, OrderEvent,
    Ticker24hEntry, TickerEvent, TradeEvent,
};
use crate::subscription::{Callback, Channel, Handler, SubscriptionKey, SubscriptionRegistry};
use crate::ws_write_handle::WsWriteHandle;
use bitvavo_core::{BookDiff, BookSnapshot, RateLimiter};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Reply delivered to an awaited request.
pub type PendingReply = Result<Value, ErrorFrame>;

/// Result of routing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// `{authenticated: ..}` ack; the session decides what to flush.
    Authenticated(bool),
    /// Delivered to at least one consumer.
    Dispatched,
    /// No consumer; dropped.
    Dropped,
}

struct PendingRequest {
    market: Option<String>,
    tx: oneshot::Sender<PendingReply>,
}

/// Routes classified frames to their consumers.
pub struct Router {
    registry: Arc<SubscriptionRegistry>,
    books: Arc<Mutex<BookManager>>,
    listeners: RwLock<HashMap<Action, Vec<Callback<Value>>>>,
    error_listeners: RwLock<Vec<Callback<ErrorFrame>>>,
    pending: Mutex<HashMap<Action, PendingRequest>>,
    rate_limiter: Arc<RateLimiter>,
    handle: WsWriteHandle,
}

impl Router {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        books: Arc<Mutex<BookManager>>,
        rate_limiter: Arc<RateLimiter>,
        handle: WsWriteHandle,
    ) -> Self {
        Self {
            registry,
            books,
            listeners: RwLock::new(HashMap::new()),
            error_listeners: RwLock::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            rate_limiter,
            handle,
        }
    }

    /// Route one frame.
    pub fn route(&self, frame: InboundFrame) -> Routed {
        match frame {
            InboundFrame::Error(error) => self.route_error(error),
            InboundFrame::Authenticated(ok) => Routed::Authenticated(ok),
            InboundFrame::Response { action, response } => self.route_response(&action, response),
            InboundFrame::Event { event, body } => self.route_event(&event, &body),
            InboundFrame::Unrecognized(value) => {
                debug!(%value, "Unrecognized frame dropped");
                Routed::Dropped
            }
        }
    }

    fn route_error(&self, error: ErrorFrame) -> Routed {
        warn!(
            code = ?error.code,
            message = %error.message,
            action = ?error.action,
            "Server error"
        );
        self.rate_limiter.observe_error(error.code, &error.message);

        let mut delivered = false;
        if let Some(action) = error.action.as_deref().and_then(Action::from_name) {
            if let Some(pending) = self.pending.lock().remove(&action) {
                delivered |= pending.tx.send(Err(error.clone())).is_ok();
            }
        }

        let listeners = self.error_listeners.read().clone();
        for listener in &listeners {
            listener(&error);
        }
        delivered |= !listeners.is_empty();

        if delivered {
            Routed::Dispatched
        } else {
            Routed::Dropped
        }
    }

    fn route_response(&self, action_name: &str, response: Value) -> Routed {
        let Some(action) = Action::from_name(action_name) else {
            debug!(action = action_name, "Reply for unknown action dropped");
            return Routed::Dropped;
        };

        let mut delivered = false;

        if action == Action::GetBook {
            delivered |= self.apply_snapshot(&response);
        }

        let response_market = response.get("market").and_then(Value::as_str);
        {
            let mut pending = self.pending.lock();
            let matches = pending.get(&action).is_some_and(|p| {
                p.market.is_none() || p.market.as_deref() == response_market
            });
            if matches {
                if let Some(p) = pending.remove(&action) {
                    delivered |= p.tx.send(Ok(response.clone())).is_ok();
                }
            }
        }

        let listeners = self
            .listeners
            .read()
            .get(&action)
            .cloned()
            .unwrap_or_default();
        for listener in &listeners {
            listener(&response);
        }
        delivered |= !listeners.is_empty();

        if delivered {
            Routed::Dispatched
        } else {
            warn!(
                action = %action,
                channel = action.channel_name(),
                "No listener or pending request for reply, dropped"
            );
            Routed::Dropped
        }
    }

    fn apply_snapshot(&self, response: &Value) -> bool {
        let snapshot = match BookSnapshot::deserialize(response) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Malformed book snapshot");
                return false;
            }
        };
        let market = snapshot.market.clone();
        let book = self.books.lock().apply_snapshot(snapshot);
        let Some(book) = book else {
            return false;
        };
        debug!(%market, nonce = book.nonce, "Book snapshot installed");
        match self.registry.get(&SubscriptionKey::new(Channel::Book, &market)) {
            Some(Handler::Book(cb)) => {
                cb(&book);
                true
            }
            _ => false,
        }
    }

    fn route_event(&self, event: &str, body: &Value) -> Routed {
        match event {
            "trade" => {
                let Some(trade) = parse_event::<TradeEvent>(event, body) else {
                    return Routed::Dropped;
                };
                match self.registry.get(&SubscriptionKey::new(Channel::Trades, &trade.market)) {
                    Some(Handler::Trades(cb)) => {
                        cb(&trade);
                        Routed::Dispatched
                    }
                    _ => unmatched(event, &trade.market),
                }
            }
            "ticker" => {
                let Some(ticker) = parse_event::<TickerEvent>(event, body) else {
                    return Routed::Dropped;
                };
                match self.registry.get(&SubscriptionKey::new(Channel::Ticker, &ticker.market)) {
                    Some(Handler::Ticker(cb)) => {
                        cb(&ticker);
                        Routed::Dispatched
                    }
                    _ => unmatched(event, &ticker.market),
                }
            }
            "ticker24h" => {
                let entries = body
                    .get("data")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let mut routed = Routed::Dropped;
                for raw in entries {
                    let Some(entry) = parse_event::<Ticker24hEntry>(event, raw) else {
                        continue;
                    };
                    match self
                        .registry
                        .get(&SubscriptionKey::new(Channel::Ticker24h, &entry.market))
                    {
                        Some(Handler::Ticker24h(cb)) => {
                            cb(&entry);
                            routed = Routed::Dispatched;
                        }
                        _ => {
                            unmatched(event, &entry.market);
                        }
                    }
                }
                routed
            }
            "candle" => {
                let Some(candle) = parse_event::<CandleEvent>(event, body) else {
                    return Routed::Dropped;
                };
                let key = SubscriptionKey::candles(&candle.market, &candle.interval);
                match self.registry.get(&key) {
                    Some(Handler::Candles(cb)) => {
                        cb(&candle);
                        Routed::Dispatched
                    }
                    _ => unmatched(event, &candle.market),
                }
            }
            "book" => {
                let Some(diff) = parse_event::<BookDiff>(event, body) else {
                    return Routed::Dropped;
                };
                self.route_book_diff(&diff)
            }
            "order" => {
                let Some(order) = parse_event::<OrderEvent>(event, body) else {
                    return Routed::Dropped;
                };
                self.route_account(AccountEvent::Order(order))
            }
            "fill" => {
                let Some(fill) = parse_event::<FillEvent>(event, body) else {
                    return Routed::Dropped;
                };
                self.route_account(AccountEvent::Fill(fill))
            }
            "subscribed" | "unsubscribed" | "authenticate" => {
                debug!(event, %body, "Informational event");
                Routed::Dispatched
            }
            _ => {
                debug!(event, "Unknown event dropped");
                Routed::Dropped
            }
        }
    }

    fn route_book_diff(&self, diff: &BookDiff) -> Routed {
        let mut routed = Routed::Dropped;

        if let Some(Handler::BookUpdates(cb)) = self
            .registry
            .get(&SubscriptionKey::new(Channel::BookUpdates, &diff.market))
        {
            cb(diff);
            routed = Routed::Dispatched;
        }

        let update = self.books.lock().apply_diff(diff);
        match update {
            BookUpdate::Applied(book) => {
                if let Some(Handler::Book(cb)) = self
                    .registry
                    .get(&SubscriptionKey::new(Channel::Book, &diff.market))
                {
                    cb(&book);
                }
                routed = Routed::Dispatched;
            }
            BookUpdate::Resync => {
                self.request_resync(&diff.market);
                routed = Routed::Dispatched;
            }
            BookUpdate::Ignored => {}
        }

        if routed == Routed::Dropped {
            debug!(market = %diff.market, nonce = diff.nonce, "Book diff without consumer");
        }
        routed
    }

    fn request_resync(&self, market: &str) {
        let frames = match SubscriptionKey::new(Channel::Book, market).subscribe_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%market, error = %e, "Failed to build resync frames");
                return;
            }
        };
        for frame in frames {
            if let Err(e) = self.handle.send_subscription(frame, false) {
                warn!(%market, error = %e, "Failed to queue resync frame");
                return;
            }
        }
        warn!(%market, "Book resync requested");
    }

    fn route_account(&self, event: AccountEvent) -> Routed {
        let market = event.market().to_string();
        match self.registry.get(&SubscriptionKey::new(Channel::Account, &market)) {
            Some(Handler::Account(cb)) => {
                cb(&event);
                Routed::Dispatched
            }
            _ => unmatched("account", &market),
        }
    }

    // ------------------------------------------------------------------------
    // Pending requests and listeners
    // ------------------------------------------------------------------------

    /// Register the awaiting request for `action`.
    ///
    /// A `market` restricts which reply is accepted (used for `getBook`).
    pub fn register_pending(
        &self,
        action: Action,
        market: Option<String>,
    ) -> oneshot::Receiver<PendingReply> {
        let (tx, rx) = oneshot::channel();
        if self
            .pending
            .lock()
            .insert(action, PendingRequest { market, tx })
            .is_some()
        {
            warn!(action = %action, "Replaced outstanding request");
        }
        rx
    }

    pub fn cancel_pending(&self, action: Action) {
        self.pending.lock().remove(&action);
    }

    /// Drop every outstanding request; waiters observe an aborted request.
    pub fn fail_all_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            warn!(count = pending.len(), "Failing outstanding requests");
            pending.clear();
        }
    }

    /// Drop outstanding requests except those whose frame was never sent.
    pub fn fail_pending_except(&self, unsent: &HashSet<Action>) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|action, _| unsent.contains(action));
        let failed = before - pending.len();
        if failed > 0 {
            warn!(count = failed, "Failing requests sent on a closed session");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn add_response_listener(&self, action: Action, listener: Callback<Value>) {
        self.listeners.write().entry(action).or_default().push(listener);
    }

    pub fn add_error_listener(&self, listener: Callback<ErrorFrame>) {
        self.error_listeners.write().push(listener);
    }
}

fn parse_event<T: DeserializeOwned>(event: &str, body: &Value) -> Option<T> {
    match T::deserialize(body) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(event, error = %e, "Malformed event dropped");
            None
        }
    }
}

fn unmatched(event: &str, market: &str) -> Routed {
    debug!(event, %market, "No subscription for event, dropped");
    Routed::Dropped
}
