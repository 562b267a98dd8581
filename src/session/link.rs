//! Resources linked to a session, split so each direction progresses on its own
//!
//! Writes never block the run loop: data is queued in an outbox and a
//! separate `select!` branch drains it. Reading from a source pauses while the
//! outbox it feeds is above its high-water mark, so a slow peer in one
//! direction throttles only that direction.

use super::{BufferQueue, Teardown};
use crate::transport::{LocalChannel, TunnelChannel, WsError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::{pending, poll_fn};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tungstenite::tungstenite::Message;

/// Upper bound on a graceful close before the resource is simply dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stop reading a source once this many bytes wait to be written onward
const STREAM_HIGH_WATER: usize = 1024 * 1024;

/// Same for messages waiting on a tunnel
const TUNNEL_HIGH_WATER: usize = 64;

/// A byte stream (client socket or outbound socket) and its write backlog
pub(crate) struct StreamLink<S> {
    halves: Option<(ReadHalf<S>, WriteHalf<S>)>,
    outbox: BufferQueue,
}

impl<S: LocalChannel> StreamLink<S> {
    pub fn new(stream: S) -> Self {
        let mut link = Self::detached();
        link.attach(stream);
        link
    }

    pub fn detached() -> Self {
        Self {
            halves: None,
            outbox: BufferQueue::new(),
        }
    }

    pub fn attach(&mut self, stream: S) {
        self.halves = Some(tokio::io::split(stream));
    }

    pub fn is_open(&self) -> bool {
        self.halves.is_some()
    }

    /// Queue bytes for writing; nothing is written until the run loop drains
    pub fn queue(&mut self, data: impl Into<bytes::Bytes>) {
        self.outbox.push(data);
    }

    pub fn has_backlog(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Whether a source feeding this link may keep reading
    pub fn has_room(&self) -> bool {
        self.outbox.total_bytes() < STREAM_HIGH_WATER
    }

    /// Borrow the read half, the write half and the backlog separately
    pub fn parts(&mut self) -> (Option<&mut ReadHalf<S>>, Option<&mut WriteHalf<S>>, &mut BufferQueue) {
        match &mut self.halves {
            Some((reader, writer)) => (Some(reader), Some(writer), &mut self.outbox),
            None => (None, None, &mut self.outbox),
        }
    }

    /// Write out the backlog now, bounded by the close timeout
    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let (_, writer, outbox) = self.parts();
        tokio::time::timeout(CLOSE_TIMEOUT, write_queued(writer, outbox))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
    }

    /// Graceful: write the backlog then FIN. Forceful: RST, backlog discarded.
    pub async fn close(&mut self, how: Teardown) {
        let Some((reader, writer)) = self.halves.take() else {
            return;
        };
        let mut stream = reader.unsplit(writer);
        match how {
            Teardown::Graceful => {
                let outbox = &mut self.outbox;
                let finish = async {
                    for chunk in outbox.drain() {
                        stream.write_all(&chunk).await?;
                    }
                    stream.shutdown().await
                };
                tokio::time::timeout(CLOSE_TIMEOUT, finish).await.ok();
            }
            Teardown::Forceful => stream.set_abortive(),
        }
        self.outbox.clear();
    }
}

/// Messages waiting to go out on a tunnel
#[derive(Default)]
pub(crate) struct Outbox {
    queue: VecDeque<Message>,
    /// Messages were handed to the sink but not flushed yet
    unflushed: bool,
}

impl Outbox {
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.unflushed
    }
}

/// The WebSocket of a session, split into its sending and receiving halves
pub(crate) struct TunnelLink<W> {
    halves: Option<(SplitSink<W, Message>, SplitStream<W>)>,
    outbox: Outbox,
}

impl<W: TunnelChannel> TunnelLink<W> {
    pub fn detached() -> Self {
        Self {
            halves: None,
            outbox: Outbox::default(),
        }
    }

    pub fn new(ws: W) -> Self {
        let mut link = Self::detached();
        link.attach(ws);
        link
    }

    pub fn attach(&mut self, ws: W) {
        self.halves = Some(ws.split());
    }

    pub fn is_open(&self) -> bool {
        self.halves.is_some()
    }

    pub fn queue(&mut self, msg: Message) {
        self.outbox.queue.push_back(msg);
    }

    pub fn has_room(&self) -> bool {
        self.outbox.queue.len() < TUNNEL_HIGH_WATER
    }

    /// Nothing queued and nothing left to flush
    pub fn is_idle(&self) -> bool {
        self.outbox.is_idle()
    }

    pub fn parts(
        &mut self,
    ) -> (
        Option<&mut SplitStream<W>>,
        Option<&mut SplitSink<W, Message>>,
        &mut Outbox,
    ) {
        match &mut self.halves {
            Some((sink, stream)) => (Some(stream), Some(sink), &mut self.outbox),
            None => (None, None, &mut self.outbox),
        }
    }

    /// Graceful: send what is queued, then a close frame. Forceful: drop the
    /// connection without a close frame.
    pub async fn close(&mut self, how: Teardown) {
        let Some((mut sink, _stream)) = self.halves.take() else {
            return;
        };
        if how == Teardown::Graceful {
            let outbox = &mut self.outbox;
            let finish = async {
                send_queued(Some(&mut sink), outbox).await?;
                sink.close().await
            };
            tokio::time::timeout(CLOSE_TIMEOUT, finish).await.ok();
        }
        self.outbox = Outbox::default();
    }
}

/// Read from a stream half; pending forever once the link is closed
pub(crate) async fn read_chunk<R: AsyncRead + Unpin>(
    reader: Option<&mut R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => pending().await,
    }
}

/// Write the backlog until it is empty
///
/// Each step is a single `write`, so dropping this future part way through
/// loses nothing: the unwritten bytes are still at the front of the backlog.
pub(crate) async fn write_queued<W: AsyncWrite + Unpin>(
    writer: Option<&mut W>,
    outbox: &mut BufferQueue,
) -> io::Result<()> {
    let Some(writer) = writer else {
        return pending().await;
    };
    while let Some(front) = outbox.front() {
        let n = writer.write(front).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        outbox.consume(n);
    }
    writer.flush().await
}

/// Next message from a tunnel; pending forever once the link is closed
pub(crate) async fn next_message<S>(stream: Option<&mut S>) -> Option<Result<Message, WsError>>
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

/// Hand queued messages to the sink and flush it
///
/// Resumable after cancellation: a message leaves the queue only once the
/// sink has accepted it, and `unflushed` remembers a pending flush.
pub(crate) async fn send_queued<K>(sink: Option<&mut K>, outbox: &mut Outbox) -> Result<(), WsError>
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let Some(sink) = sink else {
        return pending().await;
    };
    while !outbox.queue.is_empty() {
        poll_fn(|cx| sink.poll_ready_unpin(cx)).await?;
        if let Some(msg) = outbox.queue.pop_front() {
            sink.start_send_unpin(msg)?;
            outbox.unflushed = true;
        }
    }
    poll_fn(|cx| sink.poll_flush_unpin(cx)).await?;
    outbox.unflushed = false;
    Ok(())
}
