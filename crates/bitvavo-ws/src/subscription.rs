//! Subscription registry.
//!
//! Every live subscription is keyed by `(channel, market, interval)` and
//! holds the typed callback that receives its events. The key alone is
//! enough to rebuild the subscribe frames, which is how subscriptions are
//! replayed on every new session.

use crate::error::WsResult;
use crate::message::{
    AccountEvent, Action, ActionRequest, CandleEvent, ChannelSpec, SubscriptionRequest,
    Ticker24hEntry, TickerEvent, TradeEvent,
};
use bitvavo_core::{BookDiff, OrderBook};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Shared consumer callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Ticker,
    Ticker24h,
    Trades,
    Candles,
    /// Raw book diffs.
    BookUpdates,
    /// Locally maintained order book.
    Book,
    /// Own orders and fills. Requires authentication.
    Account,
}

impl Channel {
    /// Channel name used in subscribe frames.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Ticker24h => "ticker24h",
            Self::Trades => "trades",
            Self::Candles => "candles",
            Self::BookUpdates | Self::Book => "book",
            Self::Account => "account",
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Account)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ticker => "ticker",
            Self::Ticker24h => "ticker24h",
            Self::Trades => "trades",
            Self::Candles => "candles",
            Self::BookUpdates => "bookUpdates",
            Self::Book => "book",
            Self::Account => "account",
        };
        f.write_str(name)
    }
}

/// Registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub channel: Channel,
    pub market: String,
    /// Candle interval; `None` for every other channel.
    pub interval: Option<String>,
}

impl SubscriptionKey {
    pub fn new(channel: Channel, market: impl Into<String>) -> Self {
        Self {
            channel,
            market: market.into(),
            interval: None,
        }
    }

    pub fn candles(market: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            channel: Channel::Candles,
            market: market.into(),
            interval: Some(interval.into()),
        }
    }

    fn channel_spec(&self) -> ChannelSpec {
        ChannelSpec {
            name: self.channel.wire_name(),
            interval: self.interval.iter().cloned().collect(),
            markets: vec![self.market.clone()],
        }
    }

    /// Frames that establish this subscription on a fresh session.
    ///
    /// The local book asks for a snapshot before subscribing to diffs.
    pub fn subscribe_frames(&self) -> WsResult<Vec<String>> {
        let mut frames = Vec::with_capacity(2);
        if self.channel == Channel::Book {
            frames.push(
                ActionRequest::new(Action::GetBook)
                    .with("market", self.market.as_str())
                    .to_frame()?,
            );
        }
        frames.push(SubscriptionRequest::subscribe(self.channel_spec()).to_frame()?);
        Ok(frames)
    }

    pub fn unsubscribe_frame(&self) -> WsResult<String> {
        SubscriptionRequest::unsubscribe(self.channel_spec()).to_frame()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interval {
            Some(interval) => write!(f, "{}:{}:{}", self.channel, self.market, interval),
            None => write!(f, "{}:{}", self.channel, self.market),
        }
    }
}

/// Typed callback slot, one variant per channel.
#[derive(Clone)]
pub enum Handler {
    Ticker(Callback<TickerEvent>),
    Ticker24h(Callback<Ticker24hEntry>),
    Trades(Callback<TradeEvent>),
    Candles(Callback<CandleEvent>),
    BookUpdates(Callback<BookDiff>),
    Book(Callback<OrderBook>),
    Account(Callback<AccountEvent>),
}

impl Handler {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Ticker(_) => Channel::Ticker,
            Self::Ticker24h(_) => Channel::Ticker24h,
            Self::Trades(_) => Channel::Trades,
            Self::Candles(_) => Channel::Candles,
            Self::BookUpdates(_) => Channel::BookUpdates,
            Self::Book(_) => Channel::Book,
            Self::Account(_) => Channel::Account,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.channel())
    }
}

/// Live subscriptions.
///
/// Callbacks are cloned out before being invoked so no consumer code runs
/// while the lock is held.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<SubscriptionKey, Handler>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a subscription and run `f` under the same lock.
    ///
    /// `f` enqueues the subscribe frames; holding the lock keeps it atomic
    /// with respect to [`Self::replay_with`]. The entry is only stored when
    /// `f` succeeds.
    pub fn register_with<E>(
        &self,
        key: SubscriptionKey,
        handler: Handler,
        f: impl FnOnce(&SubscriptionKey) -> Result<(), E>,
    ) -> Result<(), E> {
        debug_assert_eq!(key.channel, handler.channel());
        let mut entries = self.entries.write();
        f(&key)?;
        if entries.insert(key.clone(), handler).is_some() {
            debug!(subscription = %key, "Subscription callback replaced");
        } else {
            debug!(subscription = %key, "Subscription registered");
        }
        Ok(())
    }

    pub fn register(&self, key: SubscriptionKey, handler: Handler) {
        let _ = self.register_with(key, handler, |_| Ok::<(), Infallible>(()));
    }

    pub fn unregister(&self, key: &SubscriptionKey) -> Option<Handler> {
        self.entries.write().remove(key)
    }

    /// Remove every entry of `channel` for `market` (all candle intervals)
    /// and run `f` with the removed keys and whether another entry still
    /// uses the same wire channel for that market.
    pub fn unregister_market_channel<R>(
        &self,
        channel: Channel,
        market: &str,
        f: impl FnOnce(&[SubscriptionKey], bool) -> R,
    ) -> R {
        let mut entries = self.entries.write();
        let removed: Vec<SubscriptionKey> = entries
            .keys()
            .filter(|k| k.channel == channel && k.market == market)
            .cloned()
            .collect();
        for key in &removed {
            entries.remove(key);
        }
        let wire_still_used = entries
            .keys()
            .any(|k| k.market == market && k.channel.wire_name() == channel.wire_name());
        f(&removed, wire_still_used)
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<Handler> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn for_each(&self, mut f: impl FnMut(&SubscriptionKey, &Handler)) {
        for (key, handler) in self.entries.read().iter() {
            f(key, handler);
        }
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Run `f` with a snapshot of the keys while registration is blocked.
    pub fn replay_with<R>(&self, f: impl FnOnce(&[SubscriptionKey]) -> R) -> R {
        let entries = self.entries.read();
        let mut keys: Vec<SubscriptionKey> = entries.keys().cloned().collect();
        keys.sort();
        f(&keys)
    }

    /// Subscribe frames for every entry, each paired with its privileged flag.
    pub fn replay_frames(&self) -> WsResult<Vec<(String, bool)>> {
        self.replay_with(replay_frames_for)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Build replay frames for `keys`.
pub fn replay_frames_for(keys: &[SubscriptionKey]) -> WsResult<Vec<(String, bool)>> {
    let mut frames = Vec::with_capacity(keys.len());
    for key in keys {
        let privileged = key.channel.is_private();
        for frame in key.subscribe_frames()? {
            frames.push((frame, privileged));
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ticker_handler(counter: Arc<AtomicUsize>) -> Handler {
        Handler::Ticker(Arc::new(move |_: &TickerEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn parse(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn test_subscribe_frames_per_channel() {
        let frames = SubscriptionKey::new(Channel::Ticker, "BTC-EUR")
            .subscribe_frames()
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            parse(&frames[0]),
            json!({"action": "subscribe", "channels": [{"name": "ticker", "markets": ["BTC-EUR"]}]})
        );

        let frames = SubscriptionKey::candles("BTC-EUR", "1m")
            .subscribe_frames()
            .unwrap();
        assert_eq!(
            parse(&frames[0])["channels"][0]["interval"],
            json!(["1m"])
        );

        let frames = SubscriptionKey::new(Channel::Book, "ETH-EUR")
            .subscribe_frames()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            parse(&frames[0]),
            json!({"action": "getBook", "market": "ETH-EUR"})
        );
        assert_eq!(parse(&frames[1])["channels"][0]["name"], "book");

        let frames = SubscriptionKey::new(Channel::BookUpdates, "ETH-EUR")
            .subscribe_frames()
            .unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_register_replaces_callback() {
        let registry = SubscriptionRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let key = SubscriptionKey::new(Channel::Ticker, "BTC-EUR");

        registry.register(key.clone(), ticker_handler(first.clone()));
        registry.register(key.clone(), ticker_handler(second.clone()));
        assert_eq!(registry.len(), 1);

        let Some(Handler::Ticker(cb)) = registry.get(&key) else {
            panic!("expected ticker handler");
        };
        cb(&TickerEvent {
            market: "BTC-EUR".to_string(),
            best_bid: None,
            best_bid_size: None,
            best_ask: None,
            best_ask_size: None,
            last_price: None,
        });
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_market_channel_covers_all_intervals() {
        let registry = SubscriptionRegistry::new();
        let noop: Handler = Handler::Candles(Arc::new(|_: &CandleEvent| {}));
        registry.register(SubscriptionKey::candles("BTC-EUR", "1m"), noop.clone());
        registry.register(SubscriptionKey::candles("BTC-EUR", "1h"), noop.clone());
        registry.register(SubscriptionKey::candles("ETH-EUR", "1m"), noop);

        let removed = registry.unregister_market_channel(Channel::Candles, "BTC-EUR", |removed, used| {
            assert!(!used);
            removed.len()
        });
        assert_eq!(removed, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_reports_shared_book_wire_channel() {
        let registry = SubscriptionRegistry::new();
        registry.register(
            SubscriptionKey::new(Channel::Book, "BTC-EUR"),
            Handler::Book(Arc::new(|_: &OrderBook| {})),
        );
        registry.register(
            SubscriptionKey::new(Channel::BookUpdates, "BTC-EUR"),
            Handler::BookUpdates(Arc::new(|_: &BookDiff| {})),
        );

        let used = registry.unregister_market_channel(Channel::BookUpdates, "BTC-EUR", |_, used| used);
        assert!(used, "local book still needs the wire book channel");

        let used = registry.unregister_market_channel(Channel::Book, "BTC-EUR", |_, used| used);
        assert!(!used);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replay_frames_cover_every_entry() {
        let registry = SubscriptionRegistry::new();
        registry.register(
            SubscriptionKey::new(Channel::Ticker, "BTC-EUR"),
            ticker_handler(Arc::new(AtomicUsize::new(0))),
        );
        registry.register(
            SubscriptionKey::new(Channel::Book, "BTC-EUR"),
            Handler::Book(Arc::new(|_: &OrderBook| {})),
        );
        registry.register(
            SubscriptionKey::new(Channel::Account, "BTC-EUR"),
            Handler::Account(Arc::new(|_: &AccountEvent| {})),
        );

        let frames = registry.replay_frames().unwrap();
        assert_eq!(frames.len(), 4);
        let privileged: Vec<_> = frames.iter().filter(|(_, p)| *p).collect();
        assert_eq!(privileged.len(), 1);
        assert_eq!(parse(&privileged[0].0)["channels"][0]["name"], "account");
    }

    #[test]
    fn test_for_each_and_keys() {
        let registry = SubscriptionRegistry::new();
        registry.register(
            SubscriptionKey::new(Channel::Trades, "BTC-EUR"),
            Handler::Trades(Arc::new(|_: &TradeEvent| {})),
        );
        let mut seen = Vec::new();
        registry.for_each(|key, handler| seen.push((key.to_string(), handler.channel())));
        assert_eq!(seen, vec![("trades:BTC-EUR".to_string(), Channel::Trades)]);
        assert_eq!(registry.keys().len(), 1);
        assert!(registry
            .unregister(&SubscriptionKey::new(Channel::Trades, "BTC-EUR"))
            .is_some());
        assert!(registry.is_empty());
    }
}
