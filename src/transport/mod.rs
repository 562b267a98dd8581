//! Transport layer
//!
//! Sessions never open sockets themselves. They are handed:
//! - a [`TunnelDialer`] that opens the WebSocket to the egress endpoint
//! - an [`OutboundConnector`] that opens the destination connection
//!
//! so the protocol logic is written once and the socket-opening primitive is
//! pluggable (plain TCP here, a host-provided primitive elsewhere, in-memory
//! pipes in tests).

mod tcp;
mod websocket;

pub use tcp::TcpConnector;
pub use websocket::WsDialer;

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};

/// WebSocket protocol error
pub type WsError = tungstenite::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// A message-oriented tunnel channel (a WebSocket)
pub trait TunnelChannel:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

impl<T> TunnelChannel for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

/// A byte-stream channel a session terminates toward its local peer
///
/// The SOCKS client socket on the initiator, the destination socket on the
/// egress side.
pub trait LocalChannel: AsyncRead + AsyncWrite + Unpin + Send {
    /// Make the next close abortive (RST) instead of a clean FIN
    fn set_abortive(&self) {}
}

impl LocalChannel for TcpStream {
    fn set_abortive(&self) {
        self.set_linger(Some(Duration::ZERO)).ok();
    }
}

impl LocalChannel for tokio::io::DuplexStream {}

/// Opens the WebSocket to the egress endpoint
#[async_trait]
pub trait TunnelDialer: Send + Sync + 'static {
    type Channel: TunnelChannel + 'static;

    async fn dial(&self) -> Result<Self::Channel, TransportError>;
}

/// Opens the outbound connection to the destination
#[async_trait]
pub trait OutboundConnector: Send + Sync + 'static {
    type Stream: LocalChannel + 'static;

    async fn connect(&self, host: &str, port: u16) -> Result<Self::Stream, TransportError>;
}
