//! WebSocket tunnel dialer

use super::{TransportError, TunnelDialer};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Dials the configured `ws://` or `wss://` tunnel URL
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TunnelDialer for WsDialer {
    type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn dial(&self) -> Result<Self::Channel, TransportError> {
        // disable Nagle: every chunk is its own message
        let (ws, response) = tokio::time::timeout(
            self.connect_timeout,
            connect_async_with_config(self.url.as_str(), None, true),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        debug!("[ws] upgraded ({})", response.status());
        Ok(ws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = WsDialer::new(format!("ws://{}/tunnel", addr), Duration::from_secs(5));
        assert_eq!(dialer.url(), format!("ws://{}/tunnel", addr));
        assert!(matches!(dialer.dial().await, Err(TransportError::WebSocket(_))));
    }
}
