//! Egress side: encrypted WebSocket in, plain TCP to the destination out

use super::link::{next_message, read_chunk, send_queued, write_queued, StreamLink, TunnelLink};
use super::{resolve, BufferQueue, Flow, SessionError, Teardown};
use crate::crypto::{FrameCodec, SessionNonce};
use crate::protocol::{DEFAULT_HANDSHAKE_TIMEOUT, READ_BUFFER_SIZE};
use crate::transport::{OutboundConnector, TransportError, TunnelChannel, WsError};
use futures_util::future::BoxFuture;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Egress lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressStage {
    /// Waiting for the handshake frame
    Connecting,
    /// Outbound connect in flight; decrypted data is queued
    Caching,
    /// Outbound connected; data flows both ways
    Piping,
}

type Connect<S> = BoxFuture<'static, Result<S, TransportError>>;

enum Event<S> {
    Tunnel(Option<Result<Message, WsError>>),
    TunnelFlushed(Result<(), WsError>),
    Connected(Result<S, TransportError>),
    Remote(io::Result<usize>),
    RemoteFlushed(io::Result<()>),
    HandshakeExpired,
}

/// Builds egress sessions sharing one codec and connector
pub struct EgressFactory<C> {
    codec: Arc<FrameCodec>,
    connector: Arc<C>,
    handshake_timeout: Duration,
}

impl<C: OutboundConnector> EgressFactory<C> {
    pub fn new(codec: Arc<FrameCodec>, connector: C) -> Self {
        Self {
            codec,
            connector: Arc::new(connector),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    /// How long a new tunnel may stay silent before its first frame
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn session<W: TunnelChannel>(&self, tunnel: W) -> EgressSession<W, C> {
        EgressSession {
            stage: EgressStage::Connecting,
            tunnel: TunnelLink::new(tunnel),
            remote: StreamLink::detached(),
            connecting: None,
            codec: Arc::clone(&self.codec),
            connector: Arc::clone(&self.connector),
            handshake_timeout: self.handshake_timeout,
            nonce: None,
            cache: BufferQueue::new(),
        }
    }
}

/// One accepted tunnel and the outbound connection it asked for
pub struct EgressSession<W, C: OutboundConnector> {
    stage: EgressStage,
    tunnel: TunnelLink<W>,
    remote: StreamLink<C::Stream>,
    connecting: Option<Connect<C::Stream>>,
    codec: Arc<FrameCodec>,
    connector: Arc<C>,
    handshake_timeout: Duration,
    nonce: Option<SessionNonce>,
    cache: BufferQueue,
}

impl<W: TunnelChannel, C: OutboundConnector> EgressSession<W, C> {
    pub fn stage(&self) -> EgressStage {
        self.stage
    }

    pub fn is_closed(&self) -> bool {
        !self.tunnel.is_open() && !self.remote.is_open() && self.connecting.is_none()
    }

    /// Run until either side ends
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let handshake = tokio::time::sleep(self.handshake_timeout);
        tokio::pin!(handshake);

        let result = loop {
            let awaiting_handshake = self.stage == EgressStage::Connecting;
            let read_tunnel = self.remote.has_room();
            let read_remote = self.tunnel.has_room();
            let remote_backlog = self.remote.has_backlog();
            let tunnel_busy = !self.tunnel.is_idle();

            let (ws_rd, ws_wr, to_tunnel) = self.tunnel.parts();
            let (remote_rd, remote_wr, to_remote) = self.remote.parts();

            let event = tokio::select! {
                msg = next_message(ws_rd), if read_tunnel => Event::Tunnel(msg),
                sent = send_queued(ws_wr, to_tunnel), if tunnel_busy => Event::TunnelFlushed(sent),
                connected = resolve(&mut self.connecting) => Event::Connected(connected),
                read = read_chunk(remote_rd, &mut buf), if read_remote => Event::Remote(read),
                written = write_queued(remote_wr, to_remote), if remote_backlog => Event::RemoteFlushed(written),
                _ = &mut handshake, if awaiting_handshake => Event::HandshakeExpired,
            };

            let flow = match event {
                Event::Tunnel(msg) => self.on_tunnel(msg).await,
                Event::TunnelFlushed(Ok(())) => Ok(Flow::Continue),
                Event::TunnelFlushed(Err(e)) => self.on_tunnel(Some(Err(e))).await,
                Event::Connected(connected) => self.on_connected(connected).await,
                Event::Remote(Ok(0)) => self.on_remote_end().await,
                Event::Remote(Ok(n)) => self.on_remote_data(&buf[..n]),
                Event::Remote(Err(e)) | Event::RemoteFlushed(Err(e)) => {
                    self.on_remote_error(e).await
                }
                Event::RemoteFlushed(Ok(())) => Ok(Flow::Continue),
                Event::HandshakeExpired => {
                    warn!("[websocket] no handshake within {:?}", self.handshake_timeout);
                    Err(SessionError::Timeout)
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.teardown(Teardown::Forceful).await;
        result
    }

    /// Close everything still linked to this session
    pub async fn teardown(&mut self, how: Teardown) {
        self.connecting = None;
        self.tunnel.close(how).await;
        self.remote.close(how).await;
    }

    async fn on_tunnel(
        &mut self,
        msg: Option<Result<Message, WsError>>,
    ) -> Result<Flow, SessionError> {
        match msg {
            Some(Ok(Message::Binary(data))) => self.on_tunnel_data(&data),
            Some(Ok(Message::Text(text))) => self.on_tunnel_data(text.as_bytes()),
            // the WebSocket layer answers pings with a matching pong on its own
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(Flow::Continue),
            Some(Ok(Message::Close(_))) | None => {
                info!("[websocket] closed");
                self.tunnel.close(Teardown::Graceful).await;
                self.teardown(Teardown::Forceful).await;
                Ok(Flow::Finished)
            }
            Some(Err(e)) => {
                error!("[websocket] error: {}", e);
                self.teardown(Teardown::Forceful).await;
                Err(e.into())
            }
        }
    }

    fn on_tunnel_data(&mut self, data: &[u8]) -> Result<Flow, SessionError> {
        match self.stage {
            EgressStage::Connecting => self.on_handshake(data),
            EgressStage::Caching => {
                if let Some(plain) = self.open(data) {
                    self.cache.push(plain);
                }
                Ok(Flow::Continue)
            }
            EgressStage::Piping => {
                if let Some(plain) = self.open(data) {
                    self.remote.queue(plain);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn on_handshake(&mut self, frame: &[u8]) -> Result<Flow, SessionError> {
        let (nonce, host, port) = match self.codec.open_handshake(frame) {
            Ok(opened) => opened,
            Err(e) => {
                // the run loop terminates the tunnel on the way out
                warn!("[websocket] handshake rejected: {}", e);
                return Err(SessionError::HandshakeFailed(e));
            }
        };

        info!("[connect] {}:{}", host, port);
        self.nonce = Some(nonce);
        let connector = Arc::clone(&self.connector);
        self.connecting = Some(Box::pin(async move { connector.connect(&host, port).await }));
        self.stage = EgressStage::Caching;

        Ok(Flow::Continue)
    }

    async fn on_connected(
        &mut self,
        connected: Result<C::Stream, TransportError>,
    ) -> Result<Flow, SessionError> {
        let remote = match connected {
            Ok(remote) => remote,
            Err(e) => {
                error!("[net] error: {}", e);
                self.teardown(Teardown::Forceful).await;
                return Err(e.into());
            }
        };
        debug!("[net] connected");

        self.remote.attach(remote);
        for chunk in self.cache.drain() {
            self.remote.queue(chunk);
        }
        self.stage = EgressStage::Piping;

        Ok(Flow::Continue)
    }

    fn on_remote_data(&mut self, data: &[u8]) -> Result<Flow, SessionError> {
        let Some(nonce) = self.nonce.as_ref() else {
            return Ok(Flow::Continue);
        };
        let frame = self.codec.encrypt(nonce, data)?;
        self.tunnel.queue(Message::Binary(frame.into()));
        Ok(Flow::Continue)
    }

    async fn on_remote_end(&mut self) -> Result<Flow, SessionError> {
        info!("[net] disconnected");
        self.remote.close(Teardown::Graceful).await;
        self.tunnel.close(Teardown::Graceful).await;
        Ok(Flow::Finished)
    }

    async fn on_remote_error(&mut self, e: io::Error) -> Result<Flow, SessionError> {
        error!("[net] error: {}", e);
        self.teardown(Teardown::Forceful).await;
        Err(e.into())
    }

    /// Decrypt a steady-state frame; failures are dropped
    fn open(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.nonce.as_ref()?;
        match self.codec.decrypt(nonce, frame) {
            Ok(plain) => Some(plain),
            Err(e) => {
                debug!("[websocket] dropping frame: {}", e);
                None
            }
        }
    }
}
