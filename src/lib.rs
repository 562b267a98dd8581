//! # wsdog
//!
//! An encrypted tunnelling proxy. A local endpoint speaks SOCKS5 to
//! applications and relays their traffic, AEAD-encrypted, over a WebSocket
//! to a remote egress endpoint which opens the real outbound TCP connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  SOCKS5  ┌─────────────────┐  WebSocket   ┌──────────────┐  TCP  ┌─────────────┐
//! │ local app│ ───────> │ InitiatorSession│ ═══════════> │ EgressSession│ ────> │ destination │
//! │          │ <─────── │ (wsdog-local)   │ <═══════════ │ (wsdog-server│ <──── │             │
//! └──────────┘          └─────────────────┘  AEAD frames └──────────────┘       └─────────────┘
//! ```
//!
//! Each side runs one state machine per connection:
//!
//! - initiator: `Init -> Handshake -> Caching -> Piping`
//! - egress:    `Connecting -> Caching -> Piping`
//!
//! Data that arrives before the far leg is ready is held in a [`session::BufferQueue`]
//! and flushed, in order, exactly once when the session starts piping.
//!
//! ## Wire protocol
//!
//! The first message from the initiator is `AEAD(key, nonce, host ‖ port) ‖ nonce`;
//! every later message in either direction is `AEAD(key, nonce, payload)` under the
//! same per-session nonce.

pub mod config;
pub mod crypto;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;
pub use crypto::{CipherKind, FrameCodec};
pub use session::{EgressSession, InitiatorSession, SessionSettings};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Configuration error: {0}")]
    Config(String),
}
