//! Mock provider WebSocket server.
//!
//! Stands in for both the signaling and the media server: every accepted
//! socket is handed to the test, which scripts the provider's side of the
//! conversation frame by frame.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// How long a test waits for the bridge to act before failing.
pub const MOCK_WAIT: Duration = Duration::from_secs(5);

/// A WebSocket server on a random local port.
pub struct MockRtmsServer {
    addr: SocketAddr,
    connections: Mutex<mpsc::UnboundedReceiver<MockRtmsConnection>>,
    _handle: JoinHandle<()>,
}

impl MockRtmsServer {
    /// Bind to 127.0.0.1:0 and start accepting WebSocket upgrades.
    pub async fn start() -> Result<Self, anyhow::Error> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind mock RTMS server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => {
                            let _ = tx.send(MockRtmsConnection { ws, peer });
                        }
                        Err(e) => eprintln!("Mock RTMS upgrade failed: {}", e),
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connections: Mutex::new(rx),
            _handle: handle,
        })
    }

    /// WebSocket URL of this server.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Same server, distinct path. Handy for telling media from signaling
    /// in logs.
    pub fn url_with_path(&self, path: &str) -> String {
        format!("ws://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the next accepted connection.
    pub async fn next_connection(&self) -> Result<MockRtmsConnection, anyhow::Error> {
        let mut rx = self.connections.lock().await;
        tokio::time::timeout(MOCK_WAIT, rx.recv())
            .await
            .map_err(|_| anyhow::anyhow!("No connection to mock RTMS server within {:?}", MOCK_WAIT))?
            .ok_or_else(|| anyhow::anyhow!("Mock RTMS server stopped accepting"))
    }

    /// True if no further connection arrives within `wait`.
    pub async fn no_connection_within(&self, wait: Duration) -> bool {
        let mut rx = self.connections.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.is_err()
    }
}

impl Drop for MockRtmsServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

/// The provider's end of one accepted socket.
pub struct MockRtmsConnection {
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
}

impl MockRtmsConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next text frame from the bridge, parsed as JSON. Control frames are
    /// skipped.
    pub async fn recv_json(&mut self) -> Result<Value, anyhow::Error> {
        loop {
            let message = tokio::time::timeout(MOCK_WAIT, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("No frame from bridge within {:?}", MOCK_WAIT))?
                .ok_or_else(|| anyhow::anyhow!("Bridge closed the socket"))?
                .map_err(|e| anyhow::anyhow!("WebSocket read failed: {}", e))?;

            match message {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| anyhow::anyhow!("Bridge sent invalid JSON: {}", e));
                }
                Message::Close(_) => return Err(anyhow::anyhow!("Bridge closed the socket")),
                _ => continue,
            }
        }
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), anyhow::Error> {
        self.ws
            .send(Message::text(value.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send failed: {}", e))
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.ws
            .send(Message::text(text.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send failed: {}", e))
    }

    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), anyhow::Error> {
        self.ws
            .send(Message::binary(data))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send failed: {}", e))
    }

    /// Close from the provider side.
    pub async fn close(&mut self) -> Result<(), anyhow::Error> {
        self.ws
            .close(None)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket close failed: {}", e))
    }

    /// Wait until the bridge closes the socket, discarding anything it sends
    /// first.
    pub async fn wait_closed(&mut self) -> Result<(), anyhow::Error> {
        let drain = async {
            while let Some(message) = self.ws.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };

        tokio::time::timeout(MOCK_WAIT, drain)
            .await
            .map_err(|_| anyhow::anyhow!("Bridge did not close the socket within {:?}", MOCK_WAIT))
    }

    /// True if the bridge sends nothing within `wait`.
    pub async fn silent_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.ws.next()).await.is_err()
    }
}
