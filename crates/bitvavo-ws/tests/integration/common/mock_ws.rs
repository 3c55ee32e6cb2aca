//! Mock WebSocket server for integration tests.
//!
//! Provides a WebSocket server that can:
//! - Accept connections and number them from 1
//! - Answer frames through a scripted responder, immediately or delayed
//! - Record every frame received and sent, per connection
//! - Close every open connection on demand
//! - Drop every connection right after the handshake

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Scripted answer to one inbound frame.
pub enum Reply {
    Now(String),
    After(Duration, String),
}

pub type Responder = Arc<dyn Fn(&Value) -> Vec<Reply> + Send + Sync>;

/// What a connection does once the handshake completes.
#[derive(Clone)]
enum OnOpen {
    Serve(Responder),
    /// Optionally send one text frame, then close.
    Drop(Option<String>),
}

/// One logged frame.
#[derive(Debug, Clone)]
pub enum Entry {
    Received { conn: u32, text: String },
    Sent { conn: u32, text: String },
}

impl Entry {
    /// Parsed frame the server received on `conn`.
    pub fn received_on(&self, conn: u32) -> Option<Value> {
        match self {
            Self::Received { conn: c, text } if *c == conn => serde_json::from_str(text).ok(),
            _ => None,
        }
    }
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    kick_tx: broadcast::Sender<()>,
    log: Arc<Mutex<Vec<Entry>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockWsServer {
    /// Start a server that never answers.
    pub async fn start() -> Self {
        Self::with_responder(Arc::new(|_: &Value| Vec::new())).await
    }

    /// Start a server on an available port answering through `responder`.
    pub async fn with_responder(responder: Responder) -> Self {
        Self::spawn(OnOpen::Serve(responder)).await
    }

    /// Start a server that closes every connection right after the
    /// handshake, first sending `greeting` if given.
    pub async fn dropping(greeting: Option<String>) -> Self {
        Self::spawn(OnOpen::Drop(greeting)).await
    }

    async fn spawn(on_open: OnOpen) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Arc<Mutex<Vec<Entry>>> = Arc::new(Mutex::new(Vec::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (kick_tx, _) = broadcast::channel::<()>(4);

        let log_clone = log.clone();
        let connections_clone = connections.clone();
        let kick_clone = kick_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        let conn = {
                            let mut count = connections_clone.lock().await;
                            *count += 1;
                            *count
                        };
                        tokio::spawn(handle_connection(
                            stream,
                            conn,
                            on_open.clone(),
                            log_clone.clone(),
                            kick_clone.subscribe(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            kick_tx,
            log,
            connections,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Get the number of connections received.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    pub async fn log(&self) -> Vec<Entry> {
        self.log.lock().await.clone()
    }

    /// Frames received on `conn`, parsed.
    pub async fn received(&self, conn: u32) -> Vec<Value> {
        self.log
            .lock()
            .await
            .iter()
            .filter_map(|entry| entry.received_on(conn))
            .collect()
    }

    /// Send a Close frame on every open connection.
    pub fn kick(&self) {
        let _ = self.kick_tx.send(());
    }

    /// Poll the log until `predicate` holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, predicate: impl Fn(&[Entry]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.log.lock().await) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    conn: u32,
    on_open: OnOpen,
    log: Arc<Mutex<Vec<Entry>>>,
    mut kick_rx: broadcast::Receiver<()>,
) {
    let mut ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let responder = match on_open {
        OnOpen::Serve(responder) => responder,
        OnOpen::Drop(greeting) => {
            if let Some(text) = greeting {
                log.lock().await.push(Entry::Sent {
                    conn,
                    text: text.clone(),
                });
                let _ = ws_stream.send(Message::Text(text)).await;
            }
            let _ = ws_stream.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer_log = log.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Message::Text(text) = &msg {
                writer_log.lock().await.push(Entry::Sent {
                    conn,
                    text: text.clone(),
                });
            }
            let closing = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        log.lock().await.push(Entry::Received {
                            conn,
                            text: text.clone(),
                        });
                        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        for reply in responder(&parsed) {
                            match reply {
                                Reply::Now(text) => {
                                    let _ = tx.send(Message::Text(text));
                                }
                                Reply::After(delay, text) => {
                                    let tx = tx.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        let _ = tx.send(Message::Text(text));
                                    });
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            Ok(()) = kick_rx.recv() => {
                let _ = tx.send(Message::Close(None));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockWsServer::start().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.connection_count().await, 0);
        assert!(server.log().await.is_empty());
        server.shutdown().await;
    }
}
