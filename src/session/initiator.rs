//! Initiator side: SOCKS5 client socket in, encrypted WebSocket out

use super::link::{next_message, read_chunk, send_queued, write_queued, StreamLink, TunnelLink};
use super::{heartbeat, resolve, tick, BufferQueue, Flow, SessionError, SessionSettings, Teardown};
use crate::crypto::{FrameCodec, SessionNonce};
use crate::protocol::READ_BUFFER_SIZE;
use crate::proxy::{self, Address, Reply, GREETING_REPLY};
use crate::transport::{LocalChannel, TransportError, TunnelDialer, WsError};
use futures_util::future::BoxFuture;
use std::io;
use std::sync::Arc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Initiator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorStage {
    /// Waiting for the SOCKS greeting
    Init,
    /// Waiting for the complete CONNECT request
    Handshake,
    /// Tunnel dialing; client data is queued
    Caching,
    /// Tunnel open; data flows both ways
    Piping,
}

type Dial<C> = BoxFuture<'static, (Address, Result<C, TransportError>)>;

enum Event<C> {
    Local(io::Result<usize>),
    LocalFlushed(io::Result<()>),
    Dialed(Address, Result<C, TransportError>),
    Tunnel(Option<Result<Message, WsError>>),
    TunnelFlushed(Result<(), WsError>),
    Heartbeat,
    Idle,
}

/// Builds initiator sessions sharing one codec, dialer and settings
pub struct InitiatorFactory<D> {
    codec: Arc<FrameCodec>,
    dialer: Arc<D>,
    settings: SessionSettings,
}

impl<D: TunnelDialer> InitiatorFactory<D> {
    pub fn new(codec: Arc<FrameCodec>, dialer: D, settings: SessionSettings) -> Self {
        Self {
            codec,
            dialer: Arc::new(dialer),
            settings,
        }
    }

    pub fn session<L: LocalChannel>(&self, local: L) -> InitiatorSession<L, D> {
        InitiatorSession {
            stage: InitiatorStage::Init,
            local: StreamLink::new(local),
            tunnel: TunnelLink::detached(),
            dialing: None,
            heartbeat: None,
            codec: Arc::clone(&self.codec),
            dialer: Arc::clone(&self.dialer),
            settings: self.settings.clone(),
            nonce: None,
            request: Vec::new(),
            cache: BufferQueue::new(),
        }
    }
}

/// One SOCKS5 client connection and the tunnel carrying it
pub struct InitiatorSession<L, D: TunnelDialer> {
    stage: InitiatorStage,
    local: StreamLink<L>,
    tunnel: TunnelLink<D::Channel>,
    dialing: Option<Dial<D::Channel>>,
    heartbeat: Option<Interval>,
    codec: Arc<FrameCodec>,
    dialer: Arc<D>,
    settings: SessionSettings,
    nonce: Option<SessionNonce>,
    /// Request bytes seen so far in `Handshake`
    request: Vec<u8>,
    cache: BufferQueue,
}

impl<L: LocalChannel, D: TunnelDialer> InitiatorSession<L, D> {
    pub fn stage(&self) -> InitiatorStage {
        self.stage
    }

    /// Whether both the client socket and the tunnel are gone
    pub fn is_closed(&self) -> bool {
        !self.local.is_open() && !self.tunnel.is_open() && self.dialing.is_none()
    }

    pub fn heartbeat_active(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Run until either side ends
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let idle = tokio::time::sleep(self.settings.idle_timeout);
        tokio::pin!(idle);

        let result = loop {
            // each source is read only while its destination has room
            let read_local = self.tunnel.has_room();
            let read_tunnel = self.local.has_room();
            let local_backlog = self.local.has_backlog();
            let tunnel_busy = !self.tunnel.is_idle();

            let (local_rd, local_wr, to_local) = self.local.parts();
            let (ws_rd, ws_wr, to_tunnel) = self.tunnel.parts();

            let event = tokio::select! {
                read = read_chunk(local_rd, &mut buf), if read_local => Event::Local(read),
                written = write_queued(local_wr, to_local), if local_backlog => Event::LocalFlushed(written),
                (address, dialed) = resolve(&mut self.dialing) => Event::Dialed(address, dialed),
                msg = next_message(ws_rd), if read_tunnel => Event::Tunnel(msg),
                sent = send_queued(ws_wr, to_tunnel), if tunnel_busy => Event::TunnelFlushed(sent),
                _ = tick(&mut self.heartbeat) => Event::Heartbeat,
                _ = &mut idle => Event::Idle,
            };

            // local socket activity in either direction restarts the clock
            if matches!(event, Event::Local(Ok(_)) | Event::LocalFlushed(Ok(()))) {
                idle.as_mut().reset(Instant::now() + self.settings.idle_timeout);
            }

            let flow = match event {
                Event::Local(Ok(0)) => self.on_local_end().await,
                Event::Local(Ok(n)) => self.on_local_data(&buf[..n]).await,
                Event::Local(Err(e)) | Event::LocalFlushed(Err(e)) => self.on_local_error(e).await,
                Event::LocalFlushed(Ok(())) => Ok(Flow::Continue),
                Event::Dialed(address, dialed) => self.on_dialed(address, dialed).await,
                Event::Tunnel(msg) => self.on_tunnel(msg).await,
                Event::TunnelFlushed(Ok(())) => Ok(Flow::Continue),
                Event::TunnelFlushed(Err(e)) => self.on_tunnel(Some(Err(e))).await,
                Event::Heartbeat => self.on_heartbeat(),
                Event::Idle => self.on_idle().await,
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // whatever is still linked at this point goes down hard
        self.teardown(Teardown::Forceful).await;
        result
    }

    /// Close everything still linked to this session
    pub async fn teardown(&mut self, how: Teardown) {
        self.heartbeat = None;
        self.dialing = None;
        self.tunnel.close(how).await;
        self.local.close(how).await;
    }

    async fn on_local_data(&mut self, data: &[u8]) -> Result<Flow, SessionError> {
        match self.stage {
            InitiatorStage::Init => {
                let used = proxy::parse_greeting(data);
                self.local.queue(GREETING_REPLY.to_vec());
                self.stage = InitiatorStage::Handshake;

                let rest = &data[used..];
                if rest.is_empty() {
                    Ok(Flow::Continue)
                } else {
                    self.on_request_data(rest).await
                }
            }
            InitiatorStage::Handshake => self.on_request_data(data).await,
            InitiatorStage::Caching => {
                self.cache.push(data.to_vec());
                Ok(Flow::Continue)
            }
            InitiatorStage::Piping => {
                self.send_tunnel(data)?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_request_data(&mut self, data: &[u8]) -> Result<Flow, SessionError> {
        self.request.extend_from_slice(data);

        let (address, used) = match proxy::parse_request(&self.request) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                warn!("[socks] rejected request: {}", e);
                self.local.queue(proxy::reply(e.reply_code(), 0).to_vec());
                self.local.close(Teardown::Graceful).await;
                return Err(e.into());
            }
        };

        info!("[socks] connect {}", address);
        self.local
            .queue(proxy::reply(Reply::Succeeded, address.port()).to_vec());

        let trailing = self.request.split_off(used);
        self.request = Vec::new();
        self.cache.push(trailing);

        let dialer = Arc::clone(&self.dialer);
        self.dialing = Some(Box::pin(async move {
            let dialed = dialer.dial().await;
            (address, dialed)
        }));
        self.stage = InitiatorStage::Caching;

        Ok(Flow::Continue)
    }

    async fn on_dialed(
        &mut self,
        address: Address,
        dialed: Result<D::Channel, TransportError>,
    ) -> Result<Flow, SessionError> {
        let ws = match dialed {
            Ok(ws) => ws,
            Err(e) => {
                error!("[ws] error: {}", e);
                // the client was already told the connect succeeded
                self.local.flush().await.ok();
                self.local.close(Teardown::Forceful).await;
                return Err(e.into());
            }
        };
        debug!("[ws] open");
        self.tunnel.attach(ws);

        let nonce = SessionNonce::generate()?;
        let first = self.codec.seal_handshake(&nonce, &address.host(), address.port())?;
        self.tunnel.queue(Message::Binary(first.into()));

        for chunk in self.cache.drain() {
            let frame = self.codec.encrypt(&nonce, &chunk)?;
            self.tunnel.queue(Message::Binary(frame.into()));
        }

        self.nonce = Some(nonce);
        self.heartbeat = Some(heartbeat(self.settings.heartbeat_interval));
        self.stage = InitiatorStage::Piping;

        Ok(Flow::Continue)
    }

    async fn on_tunnel(
        &mut self,
        msg: Option<Result<Message, WsError>>,
    ) -> Result<Flow, SessionError> {
        match msg {
            Some(Ok(Message::Binary(data))) => Ok(self.on_tunnel_data(&data)),
            Some(Ok(Message::Text(text))) => Ok(self.on_tunnel_data(text.as_bytes())),
            // pongs are answered by the WebSocket layer itself
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(Flow::Continue),
            Some(Ok(Message::Close(_))) | None => {
                info!("[ws] closed");
                self.teardown(Teardown::Graceful).await;
                Ok(Flow::Finished)
            }
            Some(Err(e)) => {
                error!("[ws] error: {}", e);
                self.teardown(Teardown::Forceful).await;
                Err(e.into())
            }
        }
    }

    fn on_tunnel_data(&mut self, data: &[u8]) -> Flow {
        let Some(nonce) = self.nonce.as_ref() else {
            return Flow::Continue;
        };
        match self.codec.decrypt(nonce, data) {
            Ok(plain) => self.local.queue(plain),
            Err(e) => debug!("[ws] dropping frame: {}", e),
        }
        Flow::Continue
    }

    async fn on_local_end(&mut self) -> Result<Flow, SessionError> {
        info!("[client] disconnected");
        self.tunnel.close(Teardown::Forceful).await;
        self.teardown(Teardown::Graceful).await;
        Ok(Flow::Finished)
    }

    async fn on_local_error(&mut self, e: io::Error) -> Result<Flow, SessionError> {
        error!("[client] error: {}", e);
        self.teardown(Teardown::Forceful).await;
        Err(e.into())
    }

    fn on_heartbeat(&mut self) -> Result<Flow, SessionError> {
        if self.tunnel.is_open() {
            self.tunnel.queue(Message::Ping(Default::default()));
        }
        Ok(Flow::Continue)
    }

    async fn on_idle(&mut self) -> Result<Flow, SessionError> {
        warn!("[client] timeout");
        self.teardown(Teardown::Forceful).await;
        Err(SessionError::Timeout)
    }

    fn send_tunnel(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let Some(nonce) = self.nonce.as_ref() else {
            return Ok(());
        };
        let frame = self.codec.encrypt(nonce, data)?;
        self.tunnel.queue(Message::Binary(frame.into()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;
    use crate::session::test_util::{MemDialer, MemWs};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;

    const CONNECT_IPV4: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90];

    struct Harness {
        app: DuplexStream,
        peers: mpsc::UnboundedReceiver<MemWs>,
        codec: Arc<FrameCodec>,
        task: JoinHandle<Result<(), SessionError>>,
    }

    fn start(gate: Option<oneshot::Receiver<()>>, fail: bool, settings: SessionSettings) -> Harness {
        let codec = Arc::new(FrameCodec::new("secret", CipherKind::Aes256Gcm).unwrap());
        let (tx, peers) = mpsc::unbounded_channel();
        let dialer = MemDialer {
            peers: tx,
            gate: Mutex::new(gate),
            fail,
        };
        let factory = InitiatorFactory::new(Arc::clone(&codec), dialer, settings);

        let (app, local) = tokio::io::duplex(64 * 1024);
        let session = factory.session(local);
        assert_eq!(session.stage(), InitiatorStage::Init);
        let task = tokio::spawn(session.run());

        Harness {
            app,
            peers,
            codec,
            task,
        }
    }

    async fn read_exact(app: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        app.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn next_binary(ws: &mut MemWs) -> Vec<u8> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    async fn socks_connect(app: &mut DuplexStream) {
        app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_exact(app, 2).await, [0x05, 0x00]);
        app.write_all(&CONNECT_IPV4).await.unwrap();
        assert_eq!(
            read_exact(app, 10).await,
            [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x1F, 0x90]
        );
    }

    #[tokio::test]
    async fn test_handshake_and_piping() {
        let mut h = start(None, false, SessionSettings::default());
        socks_connect(&mut h.app).await;

        let mut peer = h.peers.recv().await.unwrap();
        let first = next_binary(&mut peer).await;
        let (nonce, host, port) = h.codec.open_handshake(&first).unwrap();
        assert_eq!((host.as_str(), port), ("10.0.0.1", 8080));

        h.app.write_all(b"ping").await.unwrap();
        let frame = next_binary(&mut peer).await;
        assert_eq!(h.codec.decrypt(&nonce, &frame).unwrap(), b"ping");

        let reply = h.codec.encrypt(&nonce, b"pong").unwrap();
        peer.send(Message::Binary(reply.into())).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 4).await, b"pong");

        // undecryptable frames are dropped without ending the session
        peer.send(Message::Binary(vec![0u8; 40].into())).await.unwrap();
        let reply = h.codec.encrypt(&nonce, b"still here").unwrap();
        peer.send(Message::Binary(reply.into())).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 10).await, b"still here");

        // tunnel close ends the client socket cleanly
        peer.close(None).await.unwrap();
        let mut rest = Vec::new();
        h.app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cached_data_flushed_in_order() {
        let (open, gate) = oneshot::channel();
        let mut h = start(Some(gate), false, SessionSettings::default());

        // greeting, request and the first payload in a single write
        let mut burst = vec![0x05, 0x01, 0x00];
        burst.extend_from_slice(&CONNECT_IPV4);
        burst.extend_from_slice(b"A");
        h.app.write_all(&burst).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 12).await[..2], [0x05, 0x00]);

        h.app.write_all(b"B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.app.write_all(b"C").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        open.send(()).unwrap();

        let mut peer = h.peers.recv().await.unwrap();
        let first = next_binary(&mut peer).await;
        let (nonce, _, _) = h.codec.open_handshake(&first).unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            let frame = next_binary(&mut peer).await;
            received.extend(h.codec.decrypt(&nonce, &frame).unwrap());
        }
        assert_eq!(received, b"ABC");

        h.app.write_all(b"D").await.unwrap();
        let frame = next_binary(&mut peer).await;
        assert_eq!(h.codec.decrypt(&nonce, &frame).unwrap(), b"D");
    }

    #[tokio::test]
    async fn test_request_split_across_writes() {
        let mut h = start(None, false, SessionSettings::default());
        h.app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 2).await, [0x05, 0x00]);

        for byte in CONNECT_IPV4 {
            h.app.write_all(&[byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
        assert_eq!(read_exact(&mut h.app, 10).await[1], 0x00);
        assert!(h.peers.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsupported_command_rejected() {
        let mut h = start(None, false, SessionSettings::default());
        h.app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 2).await, [0x05, 0x00]);

        // BIND
        h.app
            .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut reply = Vec::new();
        h.app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
        // no tunnel was ever opened
        assert!(h.peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_address_type_rejected() {
        let mut h = start(None, false, SessionSettings::default());
        h.app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        read_exact(&mut h.app, 2).await;

        h.app
            .write_all(&[0x05, 0x01, 0x00, 0x09, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut reply = Vec::new();
        h.app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(h.task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let mut h = start(None, true, SessionSettings::default());
        socks_connect(&mut h.app).await;

        let mut rest = Vec::new();
        h.app.read_to_end(&mut rest).await.ok();
        assert!(matches!(
            h.task.await.unwrap(),
            Err(SessionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_client_disconnect_terminates_tunnel() {
        let mut h = start(None, false, SessionSettings::default());
        socks_connect(&mut h.app).await;
        let mut peer = h.peers.recv().await.unwrap();
        next_binary(&mut peer).await;

        drop(h.app);
        assert!(h.task.await.unwrap().is_ok());

        // no close frame: the connection just goes away
        match peer.next().await {
            Some(Ok(Message::Close(_))) => panic!("expected abrupt termination"),
            Some(Ok(Message::Binary(_))) => panic!("unexpected data"),
            _ => {}
        }
    }

    #[tokio::test]
    async fn test_tunnel_reset_destroys_client() {
        const TOTAL: usize = 256 * 1024;

        let mut h = start(None, false, SessionSettings::default());
        socks_connect(&mut h.app).await;
        let mut peer = h.peers.recv().await.unwrap();
        let first = next_binary(&mut peer).await;
        let (nonce, _, _) = h.codec.open_handshake(&first).unwrap();

        // more than the client pipe holds while the client is not reading
        for chunk in vec![0x5Au8; TOTAL].chunks(16 * 1024) {
            let frame = h.codec.encrypt(&nonce, chunk).unwrap();
            peer.send(Message::Binary(frame.into())).await.unwrap();
        }
        // the pipe under the WebSocket goes away without a close handshake
        drop(peer);

        let result = tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("session kept flushing after a tunnel error")
            .unwrap();
        assert!(matches!(result, Err(SessionError::WebSocket(_))));

        // whatever was still queued for the client is discarded
        let mut received = Vec::new();
        h.app.read_to_end(&mut received).await.ok();
        assert!(received.len() < TOTAL);
        assert!(received.iter().all(|&b| b == 0x5A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_while_piping() {
        let mut h = start(None, false, SessionSettings::default().with_idle_timeout(3600));
        socks_connect(&mut h.app).await;
        let mut peer = h.peers.recv().await.unwrap();
        next_binary(&mut peer).await;

        for _ in 0..3 {
            match peer.next().await {
                Some(Ok(Message::Ping(payload))) => assert!(payload.is_empty()),
                other => panic!("expected ping, got {:?}", other),
            }
        }

        // once the session is gone no further pings arrive
        peer.close(None).await.unwrap();
        assert!(h.task.await.unwrap().is_ok());
        tokio::time::sleep(Duration::from_secs(120)).await;
        while let Some(Ok(msg)) = peer.next().await {
            assert!(!matches!(msg, Message::Ping(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let mut h = start(None, false, SessionSettings::default().with_idle_timeout(60));
        socks_connect(&mut h.app).await;
        let mut peer = h.peers.recv().await.unwrap();
        next_binary(&mut peer).await;

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let codec = Arc::new(FrameCodec::new("secret", CipherKind::None).unwrap());
        let (tx, _peers) = mpsc::unbounded_channel();
        let dialer = MemDialer {
            peers: tx,
            gate: Mutex::new(None),
            fail: false,
        };
        let factory = InitiatorFactory::new(codec, dialer, SessionSettings::default());
        let (_app, local) = tokio::io::duplex(1024);
        let mut session = factory.session(local);

        session.teardown(Teardown::Graceful).await;
        session.teardown(Teardown::Forceful).await;
        session.teardown(Teardown::Graceful).await;
        assert!(session.is_closed());
        assert!(!session.heartbeat_active());
    }
}
