//! Socket abstraction for the chat connection.
//!
//! The client only needs to send and receive binary frames, so the WebSocket sits
//! behind [`Connector`] / [`Socket`] and can be swapped out in tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::OnceLock;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use crate::api::DEFAULT_UA;
use crate::error::{DanmakuError, Result};

/// Install the aws-lc-rs crypto provider once per process.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// An open, frame-oriented connection.
#[async_trait]
pub trait Socket: Send + 'static {
    /// Send one binary message.
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Next binary message. `None` once the peer closed the connection.
    ///
    /// Must be cancel safe, it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<Bytes>>;

    /// Best-effort close.
    async fn close(&mut self);
}

/// Opens [`Socket`]s.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Socket: Socket;

    async fn connect(&self, url: &str) -> Result<Self::Socket>;
}

/// WebSocket connector built on `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Socket = WsSocket;

    async fn connect(&self, url: &str) -> Result<WsSocket> {
        install_rustls_provider();

        let mut request = url
            .into_client_request()
            .map_err(|e| DanmakuError::connection(format!("Invalid WebSocket URL {url}: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("User-Agent", HeaderValue::from_static(DEFAULT_UA));
        headers.insert("Origin", HeaderValue::from_static("https://live.bilibili.com"));

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| DanmakuError::connection(format!("Failed to connect to {url}: {e}")))?;
        debug!(url, "WebSocket connected");
        Ok(WsSocket { stream })
    }
}

pub struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        self.stream
            .send(Message::Binary(data))
            .await
            .map_err(|e| DanmakuError::TransportClosed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket closed by server");
                    return None;
                }
                // Pings are answered by tungstenite on the next read.
                Ok(other) => trace!(?other, "Ignoring non-binary message"),
                Err(e) => return Some(Err(DanmakuError::TransportClosed(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            trace!(error = %e, "WebSocket close failed");
        }
    }
}
