//! Plain TCP outbound connector

use super::{OutboundConnector, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Opens destination connections with `TcpStream::connect`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::protocol::DEFAULT_CONNECT_TIMEOUT))
    }
}

#[async_trait]
impl OutboundConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        // Configure TCP options
        stream.set_nodelay(true).ok();

        Ok(stream)
    }
}
