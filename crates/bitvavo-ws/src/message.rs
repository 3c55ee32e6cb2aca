//! WebSocket message types.
//!
//! Outbound frames are flat JSON objects keyed by `action`. Inbound frames
//! are classified by the first of `error`, `authenticated`, `action`,
//! `event` that is present; see [`InboundFrame::classify`].

use crate::error::{WsError, WsResult};
use bitvavo_core::{Credentials, Price, Size};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Actions (request/response channel)
// ============================================================================

/// Request action. Replies come back tagged with the same action name, so
/// the action doubles as the key of its response channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    GetTime,
    GetMarkets,
    GetAssets,
    GetBook,
    GetTrades,
    GetCandles,
    GetTicker24h,
    GetTickerPrice,
    GetTickerBook,
    PrivateCreateOrder,
    PrivateUpdateOrder,
    PrivateGetOrder,
    PrivateCancelOrder,
    PrivateCancelOrders,
    PrivateGetOrders,
    PrivateGetOrdersOpen,
    PrivateGetTrades,
    PrivateGetAccount,
    PrivateGetBalance,
    PrivateGetFees,
    PrivateDepositAssets,
    PrivateWithdrawAssets,
    PrivateGetDepositHistory,
    PrivateGetWithdrawalHistory,
}

impl Action {
    pub const ALL: [Action; 24] = [
        Self::GetTime,
        Self::GetMarkets,
        Self::GetAssets,
        Self::GetBook,
        Self::GetTrades,
        Self::GetCandles,
        Self::GetTicker24h,
        Self::GetTickerPrice,
        Self::GetTickerBook,
        Self::PrivateCreateOrder,
        Self::PrivateUpdateOrder,
        Self::PrivateGetOrder,
        Self::PrivateCancelOrder,
        Self::PrivateCancelOrders,
        Self::PrivateGetOrders,
        Self::PrivateGetOrdersOpen,
        Self::PrivateGetTrades,
        Self::PrivateGetAccount,
        Self::PrivateGetBalance,
        Self::PrivateGetFees,
        Self::PrivateDepositAssets,
        Self::PrivateWithdrawAssets,
        Self::PrivateGetDepositHistory,
        Self::PrivateGetWithdrawalHistory,
    ];

    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetTime => "getTime",
            Self::GetMarkets => "getMarkets",
            Self::GetAssets => "getAssets",
            Self::GetBook => "getBook",
            Self::GetTrades => "getTrades",
            Self::GetCandles => "getCandles",
            Self::GetTicker24h => "getTicker24h",
            Self::GetTickerPrice => "getTickerPrice",
            Self::GetTickerBook => "getTickerBook",
            Self::PrivateCreateOrder => "privateCreateOrder",
            Self::PrivateUpdateOrder => "privateUpdateOrder",
            Self::PrivateGetOrder => "privateGetOrder",
            Self::PrivateCancelOrder => "privateCancelOrder",
            Self::PrivateCancelOrders => "privateCancelOrders",
            Self::PrivateGetOrders => "privateGetOrders",
            Self::PrivateGetOrdersOpen => "privateGetOrdersOpen",
            Self::PrivateGetTrades => "privateGetTrades",
            Self::PrivateGetAccount => "privateGetAccount",
            Self::PrivateGetBalance => "privateGetBalance",
            Self::PrivateGetFees => "privateGetFees",
            Self::PrivateDepositAssets => "privateDepositAssets",
            Self::PrivateWithdrawAssets => "privateWithdrawAssets",
            Self::PrivateGetDepositHistory => "privateGetDepositHistory",
            Self::PrivateGetWithdrawalHistory => "privateGetWithdrawalHistory",
        }
    }

    /// Name of the output channel replies are published on.
    pub fn channel_name(&self) -> &'static str {
        match self {
            Self::GetTime => "time",
            Self::GetMarkets => "markets",
            Self::GetAssets => "assets",
            Self::GetBook => "book",
            Self::GetTrades => "publicTrades",
            Self::GetCandles => "candles",
            Self::GetTicker24h => "ticker24h",
            Self::GetTickerPrice => "tickerPrice",
            Self::GetTickerBook => "tickerBook",
            Self::PrivateCreateOrder => "placeOrder",
            Self::PrivateUpdateOrder => "updateOrder",
            Self::PrivateGetOrder => "getOrder",
            Self::PrivateCancelOrder => "cancelOrder",
            Self::PrivateCancelOrders => "cancelOrders",
            Self::PrivateGetOrders => "getOrders",
            Self::PrivateGetOrdersOpen => "ordersOpen",
            Self::PrivateGetTrades => "trades",
            Self::PrivateGetAccount => "account",
            Self::PrivateGetBalance => "balance",
            Self::PrivateGetFees => "fees",
            Self::PrivateDepositAssets => "depositAssets",
            Self::PrivateWithdrawAssets => "withdrawAssets",
            Self::PrivateGetDepositHistory => "depositHistory",
            Self::PrivateGetWithdrawalHistory => "withdrawalHistory",
        }
    }

    /// Private actions need an authenticated session.
    pub fn is_private(&self) -> bool {
        self.as_str().starts_with("private")
    }

    /// Look up an action by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = WsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| WsError::ParseError(format!("unknown action: {s}")))
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// ============================================================================
// Outbound frames
// ============================================================================

/// Request frame: `{"action": ..., <params>}`.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub action: Action,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ActionRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            params: Map::new(),
        }
    }

    /// Add a parameter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Add a parameter when present.
    pub fn with_opt(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    /// Merge caller-supplied body parameters. Explicit parameters win.
    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        for (key, value) in body {
            self.params.entry(key).or_insert(value);
        }
        self
    }

    /// Market parameter, if any.
    pub fn market(&self) -> Option<&str> {
        self.params.get("market").and_then(Value::as_str)
    }

    pub fn to_frame(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One entry of a subscription frame's `channels` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSpec {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interval: Vec<String>,
    pub markets: Vec<String>,
}

/// `{"action": "subscribe"|"unsubscribe", "channels": [...]}`.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    pub action: &'static str,
    pub channels: Vec<ChannelSpec>,
}

impl SubscriptionRequest {
    pub fn subscribe(channel: ChannelSpec) -> Self {
        Self {
            action: "subscribe",
            channels: vec![channel],
        }
    }

    pub fn unsubscribe(channel: ChannelSpec) -> Self {
        Self {
            action: "unsubscribe",
            channels: vec![channel],
        }
    }

    pub fn to_frame(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Session authentication frame.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticateRequest {
    pub action: &'static str,
    pub key: String,
    pub signature: String,
    pub timestamp: i64,
    pub window: u64,
}

impl AuthenticateRequest {
    /// Sign `GET /websocket` at `timestamp_ms`.
    pub fn new(credentials: &Credentials, timestamp_ms: i64) -> Self {
        Self {
            action: "authenticate",
            key: credentials.api_key().to_string(),
            signature: credentials.sign(
                timestamp_ms,
                "GET",
                bitvavo_core::auth::WEBSOCKET_AUTH_PATH,
                None,
            ),
            timestamp: timestamp_ms,
            window: credentials.access_window_ms(),
        }
    }

    pub fn to_frame(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// Server-sent error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub code: Option<i64>,
    pub message: String,
    /// Action the error answers, when the server echoes it.
    pub action: Option<String>,
}

impl From<ErrorFrame> for WsError {
    fn from(frame: ErrorFrame) -> Self {
        WsError::Protocol {
            code: frame.code,
            message: frame.message,
        }
    }
}

/// Inbound frame after classification.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Error(ErrorFrame),
    Authenticated(bool),
    Response { action: String, response: Value },
    Event { event: String, body: Value },
    Unrecognized(Value),
}

impl InboundFrame {
    /// Parse and classify a text frame.
    pub fn parse(text: &str) -> WsResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::classify(value))
    }

    /// Classify by field presence: `error`, `authenticated`, `action`,
    /// `event`, in that priority.
    pub fn classify(value: Value) -> Self {
        let Value::Object(map) = value else {
            return Self::Unrecognized(value);
        };

        if let Some(error) = map.get("error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Self::Error(ErrorFrame {
                code: map.get("errorCode").and_then(Value::as_i64),
                message,
                action: map.get("action").and_then(Value::as_str).map(String::from),
            });
        }

        if let Some(authenticated) = map.get("authenticated") {
            return Self::Authenticated(authenticated.as_bool().unwrap_or(false));
        }

        if let Some(action) = map.get("action").and_then(Value::as_str) {
            let action = action.to_string();
            let response = map.get("response").cloned().unwrap_or(Value::Null);
            return Self::Response { action, response };
        }

        if let Some(event) = map.get("event").and_then(Value::as_str) {
            let event = event.to_string();
            return Self::Event {
                event,
                body: Value::Object(map),
            };
        }

        Self::Unrecognized(Value::Object(map))
    }
}

// ============================================================================
// Subscription events
// ============================================================================

/// Public trade (`trade` event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub market: String,
    #[serde(default)]
    pub id: Option<String>,
    pub amount: Size,
    pub price: Price,
    pub side: String,
    pub timestamp: i64,
}

/// Best bid/ask change (`ticker` event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerEvent {
    pub market: String,
    #[serde(default)]
    pub best_bid: Option<Price>,
    #[serde(default)]
    pub best_bid_size: Option<Size>,
    #[serde(default)]
    pub best_ask: Option<Price>,
    #[serde(default)]
    pub best_ask_size: Option<Size>,
    #[serde(default)]
    pub last_price: Option<Price>,
}

/// One market's rolling 24h statistics (`ticker24h` event `data[]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24hEntry {
    pub market: String,
    #[serde(default)]
    pub open: Option<Price>,
    #[serde(default)]
    pub high: Option<Price>,
    #[serde(default)]
    pub low: Option<Price>,
    #[serde(default)]
    pub last: Option<Price>,
    #[serde(default)]
    pub volume: Option<Size>,
    #[serde(default)]
    pub volume_quote: Option<Decimal>,
    #[serde(default)]
    pub bid: Option<Price>,
    #[serde(default)]
    pub ask: Option<Price>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// OHLCV candle. On the wire: `[timestamp, open, high, low, close, volume]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(i64, Price, Price, Price, Price, Size)")]
pub struct Candle {
    pub timestamp: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Size,
}

impl From<(i64, Price, Price, Price, Price, Size)> for Candle {
    fn from((timestamp, open, high, low, close, volume): (i64, Price, Price, Price, Price, Size)) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// `candle` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub market: String,
    pub interval: String,
    #[serde(default)]
    pub candle: Vec<Candle>,
}

/// Own order change (`order` event on the account channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: String,
    pub market: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub amount: Option<Size>,
    #[serde(default)]
    pub amount_remaining: Option<Size>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub updated: Option<i64>,
}

/// Own fill (`fill` event on the account channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillEvent {
    pub order_id: String,
    pub fill_id: String,
    pub market: String,
    pub timestamp: i64,
    pub amount: Size,
    pub side: String,
    pub price: Price,
    #[serde(default)]
    pub taker: bool,
    #[serde(default)]
    pub fee: Option<Decimal>,
    #[serde(default)]
    pub fee_currency: Option<String>,
}

/// Account channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Order(OrderEvent),
    Fill(FillEvent),
}

impl AccountEvent {
    pub fn market(&self) -> &str {
        match self {
            Self::Order(o) => &o.market,
            Self::Fill(f) => &f.market,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_action_table_roundtrip() {
        for action in Action::ALL {
            assert_eq!(Action::from_name(action.as_str()), Some(action));
        }
        assert_eq!(Action::from_name("getNothing"), None);
        assert!(Action::PrivateGetBalance.is_private());
        assert!(!Action::GetBook.is_private());
        assert_eq!(Action::PrivateCreateOrder.channel_name(), "placeOrder");
    }

    #[test]
    fn test_action_request_is_flat() {
        let frame = ActionRequest::new(Action::GetBook)
            .with("market", "BTC-EUR")
            .with_opt("depth", Some(10))
            .with_opt("limit", None::<u32>)
            .to_frame()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"action": "getBook", "market": "BTC-EUR", "depth": 10})
        );
    }

    #[test]
    fn test_with_body_keeps_explicit_params() {
        let mut body = Map::new();
        body.insert("market".to_string(), json!("ETH-EUR"));
        body.insert("amount".to_string(), json!("0.1"));
        let request = ActionRequest::new(Action::PrivateCreateOrder)
            .with("market", "BTC-EUR")
            .with_body(body);
        assert_eq!(request.market(), Some("BTC-EUR"));
        assert_eq!(request.params["amount"], json!("0.1"));
    }

    #[test]
    fn test_subscription_frames() {
        let frame = SubscriptionRequest::subscribe(ChannelSpec {
            name: "candles",
            interval: vec!["1h".to_string()],
            markets: vec!["BTC-EUR".to_string()],
        })
        .to_frame()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"action": "subscribe", "channels": [{"name": "candles", "interval": ["1h"], "markets": ["BTC-EUR"]}]})
        );

        let frame = SubscriptionRequest::unsubscribe(ChannelSpec {
            name: "ticker",
            interval: vec![],
            markets: vec!["BTC-EUR".to_string()],
        })
        .to_frame()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"action": "unsubscribe", "channels": [{"name": "ticker", "markets": ["BTC-EUR"]}]})
        );
    }

    #[test]
    fn test_authenticate_frame() {
        let creds = Credentials::new("mykey", "mysecret");
        let frame = AuthenticateRequest::new(&creds, 1_700_000_000_000);
        assert_eq!(frame.action, "authenticate");
        assert_eq!(frame.key, "mykey");
        assert_eq!(frame.window, 10_000);
        assert_eq!(
            frame.signature,
            "8bbb8782da9f79e9c606cf9d0b1079bb9017bbea76e16414eb04075aef5f49a4"
        );
    }

    #[test]
    fn test_classify_priority() {
        // error wins over action
        let frame = InboundFrame::classify(json!({
            "action": "privateCreateOrder",
            "errorCode": 216,
            "error": "Insufficient balance."
        }));
        match frame {
            InboundFrame::Error(e) => {
                assert_eq!(e.code, Some(216));
                assert_eq!(e.action.as_deref(), Some("privateCreateOrder"));
            }
            other => panic!("expected error, got {other:?}"),
        }

        // authenticated wins over event
        let frame = InboundFrame::classify(json!({"event": "authenticate", "authenticated": true}));
        assert!(matches!(frame, InboundFrame::Authenticated(true)));

        let frame = InboundFrame::classify(json!({"action": "getTime", "response": {"time": 1}}));
        match frame {
            InboundFrame::Response { action, response } => {
                assert_eq!(action, "getTime");
                assert_eq!(response, json!({"time": 1}));
            }
            other => panic!("expected response, got {other:?}"),
        }

        let frame = InboundFrame::classify(json!({"event": "trade", "market": "BTC-EUR"}));
        assert!(matches!(frame, InboundFrame::Event { ref event, .. } if event == "trade"));

        assert!(matches!(
            InboundFrame::classify(json!({"foo": 1})),
            InboundFrame::Unrecognized(_)
        ));
        assert!(matches!(
            InboundFrame::classify(json!([1, 2])),
            InboundFrame::Unrecognized(_)
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(InboundFrame::parse("{not json").is_err());
    }

    #[test]
    fn test_trade_event_parse() {
        let trade: TradeEvent = serde_json::from_value(json!({
            "event": "trade",
            "timestamp": 1700000000000i64,
            "market": "BTC-EUR",
            "id": "391f4d94-485f-4fb0-b11f-39da1cfcfc2d",
            "amount": "0.1",
            "price": "5012",
            "side": "sell"
        }))
        .unwrap();
        assert_eq!(trade.price, Price::new(dec!(5012)));
        assert_eq!(trade.amount, Size::new(dec!(0.1)));
    }

    #[test]
    fn test_candle_event_parse() {
        let event: CandleEvent = serde_json::from_value(json!({
            "event": "candle",
            "market": "BTC-EUR",
            "interval": "1h",
            "candle": [[1700000000000i64, "5000", "5100", "4900", "5050", "12.5"]]
        }))
        .unwrap();
        assert_eq!(event.candle.len(), 1);
        assert_eq!(event.candle[0].close, Price::new(dec!(5050)));
        assert_eq!(event.candle[0].volume, Size::new(dec!(12.5)));
    }

    #[test]
    fn test_fill_event_parse() {
        let fill: FillEvent = serde_json::from_value(json!({
            "event": "fill",
            "timestamp": 1700000000000i64,
            "market": "BTC-EUR",
            "orderId": "o-1",
            "fillId": "f-1",
            "side": "buy",
            "amount": "0.5",
            "price": "5000",
            "taker": true,
            "fee": "0.0125",
            "feeCurrency": "EUR"
        }))
        .unwrap();
        assert!(fill.taker);
        assert_eq!(fill.fee, Some(dec!(0.0125)));
        assert_eq!(AccountEvent::Fill(fill).market(), "BTC-EUR");
    }
}
