//! Listener loops for both endpoints
//!
//! The local endpoint hands every accepted SOCKS client straight to an
//! initiator session. The egress endpoint sits behind a small front
//! controller: it sniffs the HTTP request head, serves a decoy 404 page to
//! anything that is not a WebSocket upgrade on the tunnel path, and only then
//! completes the upgrade and starts an egress session.

mod http;
mod rewind;

pub use http::{decoy_response, read_head, RequestHead, MAX_HEAD_LEN};
pub use rewind::Rewind;

use crate::protocol::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::session::{EgressFactory, InitiatorFactory, SessionError};
use crate::transport::{OutboundConnector, TunnelDialer};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, info_span, Instrument};

#[cfg(feature = "tls")]
pub use tokio_rustls::TlsAcceptor;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept SOCKS clients forever, one initiator session each
pub async fn serve_local<D: TunnelDialer>(
    listener: TcpListener,
    factory: Arc<InitiatorFactory<D>>,
) -> io::Result<()> {
    info!("[server] listening at {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("[server] error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        debug!("New connection from {}", peer);
        stream.set_nodelay(true).ok();

        let factory = Arc::clone(&factory);
        tokio::spawn(
            async move {
                if let Err(e) = factory.session(stream).run().await {
                    debug!("Session ended: {}", e);
                }
            }
            .instrument(info_span!("client", %peer)),
        );
    }
}

/// The egress front controller
pub struct EgressServer<C> {
    factory: EgressFactory<C>,
    path: String,
    conn_semaphore: Semaphore,
    handshake_timeout: Duration,
    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
}

impl<C: OutboundConnector> EgressServer<C> {
    pub fn new(factory: EgressFactory<C>, path: impl Into<String>, max_connections: usize) -> Self {
        Self {
            factory,
            path: path.into(),
            conn_semaphore: Semaphore::new(max_connections.max(1)),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Bound on TLS, the request head and the upgrade of a new connection
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Terminate TLS on accepted connections before looking at HTTP
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Accept connections forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("[server] listening at {}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("[server] error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            debug!("New connection from {}", peer);

            let server = Arc::clone(&self);
            tokio::spawn(
                async move {
                    if let Err(e) = server.handle_connection(stream).await {
                        debug!("Connection error: {}", e);
                    }
                }
                .instrument(info_span!("tunnel", %peer)),
            );
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), SessionError> {
        let Ok(_permit) = self.conn_semaphore.acquire().await else {
            return Ok(());
        };
        stream.set_nodelay(true)?;
        let deadline = Instant::now() + self.handshake_timeout;

        #[cfg(feature = "tls")]
        {
            if let Some(acceptor) = &self.tls {
                let stream = timeout_at(deadline, acceptor.accept(stream))
                    .await
                    .map_err(|_| SessionError::Timeout)??;
                debug!("TLS handshake complete with client");
                return self.route(stream, deadline).await;
            }
        }

        self.route(stream, deadline).await
    }

    /// Route one plain-text HTTP connection; everything before the session
    /// starts has to finish by `deadline`
    async fn route<S>(&self, stream: S, deadline: Instant) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let upgraded = match timeout_at(deadline, self.upgrade(stream)).await {
            Ok(upgraded) => upgraded?,
            Err(_) => {
                debug!("[server] handshake timed out");
                return Err(SessionError::Timeout);
            }
        };

        match upgraded {
            Some(ws) => self.factory.session(ws).run().await,
            None => Ok(()),
        }
    }

    /// Answer with the decoy, or complete the WebSocket upgrade
    async fn upgrade<S>(&self, mut stream: S) -> Result<Option<WebSocketStream<Rewind<S>>>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some((buf, end)) = read_head(&mut stream).await? else {
            decoy(stream).await?;
            return Ok(None);
        };

        match RequestHead::parse(&buf[..end]) {
            Some(head) if head.is_tunnel(&self.path) => {
                debug!("[server] upgrade {}", head.path);
            }
            Some(head) => {
                debug!("[server] {} {} -> 404", head.method, head.path);
                decoy(stream).await?;
                return Ok(None);
            }
            None => {
                decoy(stream).await?;
                return Ok(None);
            }
        }

        let ws = tokio_tungstenite::accept_async(Rewind::new(buf, stream)).await?;
        Ok(Some(ws))
    }
}

async fn decoy<S: AsyncWrite + Unpin>(mut stream: S) -> Result<(), SessionError> {
    stream.write_all(&decoy_response()).await?;
    stream.shutdown().await?;
    Ok(())
}
