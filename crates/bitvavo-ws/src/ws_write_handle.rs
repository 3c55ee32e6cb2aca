//! WebSocket write handle for sending frames.
//!
//! Frames are queued on an unbounded channel consumed by the session task,
//! so the handle stays valid across reconnects.

use crate::connection::ConnectionState;
use crate::error::WsError;
use crate::message::Action;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound frame queued for the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutbound {
    /// Subscribe/unsubscribe frame. Discarded at session open since the
    /// registry replay rebuilds every live subscription.
    Subscription { text: String, privileged: bool },
    /// Action request. Survives reconnects.
    Request { action: Action, text: String },
}

impl WsOutbound {
    pub fn text(&self) -> &str {
        match self {
            Self::Subscription { text, .. } | Self::Request { text, .. } => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Subscription { text, .. } | Self::Request { text, .. } => text,
        }
    }

    /// Privileged frames wait for the session to authenticate.
    pub fn is_privileged(&self) -> bool {
        match self {
            Self::Subscription { privileged, .. } => *privileged,
            Self::Request { action, .. } => action.is_private(),
        }
    }

    pub fn action(&self) -> Option<Action> {
        match self {
            Self::Request { action, .. } => Some(*action),
            Self::Subscription { .. } => None,
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self, Self::Subscription { .. })
    }
}

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Privileged frame without configured credentials.
    MissingCredentials,
    /// Channel closed (connection manager dropped).
    ChannelClosed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredentials => write!(f, "missing credentials"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<SendError> for WsError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::MissingCredentials => WsError::MissingCredentials(e.to_string()),
            SendError::ChannelClosed => WsError::SendFailed(e.to_string()),
        }
    }
}

/// Write handle for queuing frames to the WebSocket.
///
/// Sends never wait for the socket: while disconnected, frames sit in the
/// queue until the next session drains it.
#[derive(Clone)]
pub struct WsWriteHandle {
    tx: mpsc::UnboundedSender<WsOutbound>,
    state: Arc<RwLock<ConnectionState>>,
    has_credentials: bool,
}

impl WsWriteHandle {
    pub fn new(
        tx: mpsc::UnboundedSender<WsOutbound>,
        state: Arc<RwLock<ConnectionState>>,
        has_credentials: bool,
    ) -> Self {
        Self {
            tx,
            state,
            has_credentials,
        }
    }

    /// Queue a subscribe/unsubscribe frame.
    pub fn send_subscription(&self, text: String, privileged: bool) -> Result<(), SendError> {
        self.enqueue(WsOutbound::Subscription { text, privileged })
    }

    /// Queue an action request. Private actions are held until the
    /// session authenticates.
    pub fn send_request(&self, action: Action, text: String) -> Result<(), SendError> {
        self.enqueue(WsOutbound::Request { action, text })
    }

    fn enqueue(&self, frame: WsOutbound) -> Result<(), SendError> {
        if frame.is_privileged() && !self.has_credentials {
            return Err(SendError::MissingCredentials);
        }
        debug!(
            privileged = frame.is_privileged(),
            subscription = frame.is_subscription(),
            "Frame queued"
        );
        self.tx.send(frame).map_err(|_| SendError::ChannelClosed)
    }

    pub fn has_credentials(&self) -> bool {
        self.has_credentials
    }

    /// True while a session is open (authenticated or not).
    pub fn is_connected(&self) -> bool {
        matches!(
            *self.state.read(),
            ConnectionState::Connected | ConnectionState::Authenticated
        ) && !self.tx.is_closed()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle(
        state: ConnectionState,
        has_credentials: bool,
    ) -> (WsWriteHandle, mpsc::UnboundedReceiver<WsOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WsWriteHandle::new(tx, Arc::new(RwLock::new(state)), has_credentials);
        (handle, rx)
    }

    #[tokio::test]
    async fn test_send_request_queues_frame() {
        let (handle, mut rx) = create_test_handle(ConnectionState::Connected, false);

        handle
            .send_request(Action::GetTime, r#"{"action":"getTime"}"#.to_string())
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.text(), r#"{"action":"getTime"}"#);
        assert_eq!(frame.action(), Some(Action::GetTime));
        assert!(!frame.is_privileged());
        assert!(!frame.is_subscription());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_queued() {
        let (handle, mut rx) = create_test_handle(ConnectionState::Disconnected, false);

        handle.send_subscription("sub".to_string(), false).unwrap();
        assert!(!handle.is_connected());
        assert_eq!(
            rx.recv().await.unwrap(),
            WsOutbound::Subscription {
                text: "sub".to_string(),
                privileged: false
            }
        );
    }

    #[test]
    fn test_privileged_without_credentials_rejected() {
        let (handle, mut rx) = create_test_handle(ConnectionState::Connected, false);

        assert_eq!(
            handle.send_request(Action::PrivateGetBalance, "private".to_string()),
            Err(SendError::MissingCredentials)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_privileged_with_credentials_queued() {
        let (handle, mut rx) = create_test_handle(ConnectionState::Authenticated, true);

        handle
            .send_request(Action::PrivateGetBalance, "private".to_string())
            .unwrap();
        assert!(rx.try_recv().unwrap().is_privileged());
        assert!(handle.is_connected());
    }

    #[test]
    fn test_channel_closed() {
        let (handle, rx) = create_test_handle(ConnectionState::Connected, false);
        drop(rx);

        assert_eq!(
            handle.send_request(Action::GetTime, "x".to_string()),
            Err(SendError::ChannelClosed)
        );
        assert!(handle.is_closed());
        assert!(!handle.is_connected());
    }
}
