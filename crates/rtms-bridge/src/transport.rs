//! WebSocket transport.
//!
//! Channels talk to the provider through the [`Transport`] and
//! [`TransportFactory`] traits so their state machines can be driven by an
//! in-memory transport in tests. The production implementation is built on
//! tokio-tungstenite: the write half sits behind a mutex, the read half is
//! drained by a pump task that turns frames into [`TransportEvent`]s.

use crate::errors::BridgeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Bound on the TCP + TLS + upgrade exchange.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the WebSocket close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffered inbound events per connection.
const EVENT_BUFFER: usize = 256;

/// A data frame received from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// An event produced by the read side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// The connection is gone. `reason` is the close-frame reason or the
    /// read error, when there was one.
    Disconnected { reason: Option<String> },
}

/// Write side of an open connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    async fn send_text(&self, text: String) -> Result<(), BridgeError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Opens connections.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Connect to `url`, returning the write side and the inbound event stream.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), BridgeError>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// tokio-tungstenite connection.
pub struct WebSocketTransport {
    sink: Mutex<Option<WsSink>>,
    pump_cancel: CancellationToken,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&self, text: String) -> Result<(), BridgeError> {
        let mut sink_guard = self.sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| BridgeError::Transport("socket is closed".to_string()))?;

        trace!(target: "rtms.transport", bytes = text.len(), "--> Sending text frame");

        sink.send(Message::text(text))
            .await
            .map_err(|e| BridgeError::Transport(format!("send failed: {e}")))
    }

    async fn close(&self) {
        // Releases the read half even if this future is dropped mid-close.
        let _pump_guard = self.pump_cancel.clone().drop_guard();

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            // Best effort: the peer may already be gone or stop reading.
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(target: "rtms.transport", error = %e, "Close handshake failed");
                }
                Err(_) => {
                    debug!(target: "rtms.transport", "Close handshake timed out");
                }
            }
        }
    }
}

/// Factory for tokio-tungstenite connections (`ws://` and `wss://`).
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransportFactory;

impl WebSocketTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), BridgeError> {
        debug!(target: "rtms.transport", url = %url, "Dialing");

        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| BridgeError::Transport(format!("connect to {url} timed out")))?
            .map_err(|e| BridgeError::Transport(format!("connect to {url} failed: {e}")))?;

        let (sink, stream) = stream.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let pump_cancel = CancellationToken::new();

        tokio::spawn(read_pump(stream, event_tx, pump_cancel.clone()));

        let transport = Arc::new(WebSocketTransport {
            sink: Mutex::new(Some(sink)),
            pump_cancel,
        });

        Ok((transport, event_rx))
    }
}

async fn read_pump(
    mut stream: WsStream,
    event_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break Some("closed locally".to_string()),
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
            Some(Ok(Message::Binary(data))) => Frame::Binary(data),
            Some(Ok(Message::Close(close))) => {
                trace!(target: "rtms.transport", "Received close frame");
                break close.map(|c| format!("{} {}", u16::from(c.code), c.reason.as_str()));
            }
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(target: "rtms.transport", error = %e, "WebSocket read failed");
                break Some(e.to_string());
            }
            None => break None,
        };

        if event_tx.send(TransportEvent::Frame(frame)).await.is_err() {
            trace!(target: "rtms.transport", "Event receiver dropped, closing read pump");
            return;
        }
    };

    let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
}

/// In-memory transport for state machine tests.
#[cfg(test)]
#[allow(clippy::expect_used)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// The test side of one mock connection.
    pub(crate) struct MockConnection {
        pub url: String,
        pub sent: mpsc::UnboundedReceiver<String>,
        pub inbound: mpsc::Sender<TransportEvent>,
        pub closed: Arc<AtomicBool>,
    }

    impl MockConnection {
        /// Next frame the channel sent, decoded as JSON.
        pub async fn next_sent(&mut self) -> serde_json::Value {
            let text = tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
                .await
                .expect("timed out waiting for an outbound frame")
                .expect("transport dropped");
            serde_json::from_str(&text).expect("outbound frame is JSON")
        }

        pub async fn push_text(&self, text: impl Into<String>) {
            self.inbound
                .send(TransportEvent::Frame(Frame::Text(text.into())))
                .await
                .expect("channel dropped its event stream");
        }

        pub async fn push_json(&self, value: serde_json::Value) {
            self.push_text(value.to_string()).await;
        }

        pub async fn push_binary(&self, data: &'static [u8]) {
            self.inbound
                .send(TransportEvent::Frame(Frame::Binary(Bytes::from_static(data))))
                .await
                .expect("channel dropped its event stream");
        }

        pub async fn disconnect(&self) {
            let _ = self
                .inbound
                .send(TransportEvent::Disconnected { reason: None })
                .await;
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        /// True when no outbound frame is pending.
        pub fn nothing_sent(&mut self) -> bool {
            self.sent.try_recv().is_err()
        }
    }

    struct MockTransport {
        sent: mpsc::UnboundedSender<String>,
        closed: Arc<AtomicBool>,
        stall_close: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, text: String) -> Result<(), BridgeError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::Transport("socket is closed".to_string()));
            }
            self.sent
                .send(text)
                .map_err(|_| BridgeError::Transport("peer dropped".to_string()))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            if self.stall_close {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Hands each new connection to the test through `connections`.
    pub(crate) struct MockTransportFactory {
        connections: mpsc::UnboundedSender<MockConnection>,
        refuse: AtomicBool,
        stall_close: AtomicBool,
    }

    impl MockTransportFactory {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockConnection>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    connections: tx,
                    refuse: AtomicBool::new(false),
                    stall_close: AtomicBool::new(false),
                }),
                rx,
            )
        }

        /// Make every later connect attempt fail.
        pub fn refuse_connections(&self) {
            self.refuse.store(true, Ordering::SeqCst);
        }

        /// Make `close` on later connections mark the socket closed and then
        /// never return, like a peer that stopped reading.
        pub fn stall_close(&self) {
            self.stall_close.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn connect(
            &self,
            url: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), BridgeError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(BridgeError::Transport(format!("connect to {url} refused")));
            }

            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
            let closed = Arc::new(AtomicBool::new(false));

            let _ = self.connections.send(MockConnection {
                url: url.to_string(),
                sent: sent_rx,
                inbound: event_tx,
                closed: Arc::clone(&closed),
            });

            Ok((
                Arc::new(MockTransport {
                    sent: sent_tx,
                    closed,
                    stall_close: self.stall_close.load(Ordering::SeqCst),
                }),
                event_rx,
            ))
        }
    }

    /// Wait for the channel under test to open its next connection.
    pub(crate) async fn next_connection(
        connections: &mut mpsc::UnboundedReceiver<MockConnection>,
    ) -> MockConnection {
        tokio::time::timeout(Duration::from_secs(2), connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("factory dropped")
    }
}
