//! Per-connection session state machines
//!
//! Each accepted connection gets exactly one session object. A session owns
//! every resource linked to the connection (local socket, tunnel, outbound
//! socket, timers) and drives them from a single `select!` loop, so there is
//! one control flow per session. Closing a resource takes it out of its slot;
//! closing an empty slot is a no-op, which makes every teardown path
//! idempotent.

mod cache;
mod egress;
mod initiator;
mod link;

pub use cache::BufferQueue;
pub use egress::{EgressFactory, EgressSession, EgressStage};
pub use initiator::{InitiatorFactory, InitiatorSession, InitiatorStage};

use crate::crypto::CryptoError;
use crate::protocol::{DEFAULT_IDLE_TIMEOUT, HEARTBEAT_INTERVAL};
use crate::proxy::ProxyError;
use crate::transport::{TransportError, WsError};
use futures_util::future::BoxFuture;
use std::future::pending;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Why a session ended abnormally
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProxyError),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(CryptoError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Inactivity timeout")]
    Timeout,
}

/// How a linked resource is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// FIN for sockets, close frame for the WebSocket
    Graceful,
    /// RST for sockets, connection dropped without a close frame
    Forceful,
}

/// Timing knobs shared by every session a factory creates
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Local inactivity timeout (initiator only)
    pub idle_timeout: Duration,
    /// Ping period while piping (initiator only)
    pub heartbeat_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl SessionSettings {
    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout = Duration::from_secs(secs);
        self
    }
}

/// What the loop does after an event was handled
enum Flow {
    Continue,
    Finished,
}

/// Drive an in-flight connect; the slot is cleared once it resolves
async fn resolve<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(fut) => {
            let out = fut.await;
            *slot = None;
            out
        }
        None => pending().await,
    }
}

async fn tick(slot: &mut Option<Interval>) {
    match slot {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// Periodic timer whose first tick is one full period away
fn heartbeat(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
