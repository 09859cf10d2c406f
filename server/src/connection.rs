//! The single active client connection.
//!
//! A connection is split in two halves once accepted. The read half stays
//! with the network thread's accept loop and runs [`read_loop`]; the write
//! half moves into a writer task running [`write_loop`], which is the only
//! code that ever writes to the socket. Outbound frames reach it through the
//! [`ConnectionSlot`], so each frame hits the wire whole and frames from
//! different callers never interleave.
//!
//! Every connection carries a child of the server's cancellation token.
//! Cancelling it (a failed write, a detach, or the server stopping) ends both
//! loops at once, including a write that is stuck on a peer that never reads.

use crate::error::BridgeError;
use crate::queue::InboundProducer;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use shared::{Decoded, FrameCodec, ProtocolError};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Progress reports for one outbound frame, in order.
#[derive(Debug)]
pub(crate) enum WriteProgress {
    /// The writer took the frame off the queue.
    Started,
    Finished(io::Result<()>),
}

pub(crate) type WriteResult = std_mpsc::Receiver<WriteProgress>;

#[derive(Debug)]
pub(crate) struct OutboundFrame {
    pub payload: Bytes,
    pub done: std_mpsc::SyncSender<WriteProgress>,
}

struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    token: CancellationToken,
}

/// Holds the active connection, if any. At most one at a time.
#[derive(Default)]
pub(crate) struct ConnectionSlot {
    active: Mutex<Option<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes a freshly accepted connection and returns its id.
    pub fn attach(
        &self,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        token: CancellationToken,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.lock().replace(ConnectionHandle {
            id,
            peer,
            outbound,
            token,
        });
        if let Some(previous) = previous {
            warn!("Replacing stale connection to {}", previous.peer);
            previous.token.cancel();
        }
        id
    }

    /// Removes connection `id` from the slot and cancels it.
    ///
    /// Does nothing if a different connection is active by now.
    pub fn detach(&self, id: u64) {
        let mut active = self.lock();
        if active.as_ref().map(|handle| handle.id) == Some(id) {
            if let Some(handle) = active.take() {
                handle.token.cancel();
            }
        }
    }

    /// Cancels whatever connection is active.
    pub fn close_all(&self) {
        if let Some(handle) = self.lock().take() {
            debug!("Closing connection to {}", handle.peer);
            handle.token.cancel();
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.lock().as_ref() {
            Some(handle) if !handle.token.is_cancelled() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock()
            .as_ref()
            .filter(|handle| !handle.token.is_cancelled())
            .map(|handle| handle.peer)
    }

    /// Hands one complete payload to the writer of the active connection.
    ///
    /// The slot lock is held while the whole frame is queued. Returns the
    /// connection id and the channel that reports the write progress.
    pub fn enqueue(&self, payload: Bytes) -> Result<(u64, WriteResult), BridgeError> {
        let active = self.lock();
        let handle = match active.as_ref() {
            Some(handle) if !handle.token.is_cancelled() => handle,
            _ => return Err(BridgeError::NotConnected),
        };

        let (done, progress) = std_mpsc::sync_channel(2);
        handle
            .outbound
            .send(OutboundFrame { payload, done })
            .map_err(|_| BridgeError::NotConnected)?;
        Ok((handle.id, progress))
    }
}

/// Why a receive loop ended.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// Peer closed the stream between frames.
    PeerClosed,
    /// Peer closed the stream with part of a frame still buffered.
    Truncated { buffered: usize },
    /// The socket reported an error.
    Failed(io::Error),
    /// The connection token was cancelled (failed write, replacement or shutdown).
    Cancelled,
}

fn into_io(error: ProtocolError) -> io::Error {
    match error {
        ProtocolError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Reads frames until the stream ends or `token` is cancelled. Each complete
/// UTF-8 frame is pushed to `inbound` as soon as its last byte arrives.
pub(crate) async fn read_loop<R>(
    reader: R,
    inbound: &InboundProducer,
    token: &CancellationToken,
    chunk_size: usize,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::with_capacity(reader, FrameCodec::new(), chunk_size.max(1));

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return ReadOutcome::Cancelled,
            next = frames.next() => next,
        };

        match next {
            None => return ReadOutcome::PeerClosed,
            Some(Ok(Decoded::Frame(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(message) => {
                    trace!("Received frame of {} bytes", bytes.len());
                    inbound.push(message.to_string());
                }
                Err(e) => warn!("Dropping frame with invalid UTF-8: {}", e),
            },
            Some(Ok(Decoded::Malformed { length })) => {
                warn!("Skipping frame with invalid length prefix {}", length);
            }
            Some(Err(ProtocolError::Truncated { buffered })) => {
                return ReadOutcome::Truncated { buffered }
            }
            Some(Err(e)) => return ReadOutcome::Failed(into_io(e)),
        }
    }
}

/// Writes queued frames one at a time until the queue closes, a write fails
/// or `token` is cancelled. Each write is bounded by `write_timeout` from the
/// moment the frame is dequeued. A failure cancels the connection and
/// detaches it from `slot`.
pub(crate) async fn write_loop<W>(
    writer: W,
    mut frames: mpsc::UnboundedReceiver<OutboundFrame>,
    slot: Arc<ConnectionSlot>,
    id: u64,
    token: CancellationToken,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // The sender may have given up waiting already.
        let _ = frame.done.send(WriteProgress::Started);
        let length = frame.payload.len();

        let result = tokio::select! {
            _ = token.cancelled() => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )),
            sent = tokio::time::timeout(write_timeout, sink.send(frame.payload)) => match sent {
                Ok(sent) => sent.map_err(into_io),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
            },
        };

        let failed = result.is_err();
        match &result {
            Ok(()) => trace!("Wrote frame with {} payload bytes", length),
            Err(e) if token.is_cancelled() => debug!("Write abandoned: {}", e),
            Err(e) => warn!("Write to client failed: {}", e),
        }
        if failed {
            slot.detach(id);
            token.cancel();
        }

        let _ = frame.done.send(WriteProgress::Finished(result));
        if failed {
            break;
        }
    }

    // Buffered bytes of an abandoned frame are dropped, not flushed.
    let mut writer = sink.into_inner();
    if let Err(e) = writer.shutdown().await {
        debug!("Shutting down write half failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::inbound_queue;
    use shared::encode_frame;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000)
    }

    fn frame(text: &str) -> Vec<u8> {
        encode_frame(text.as_bytes()).unwrap()
    }

    fn finished(progress: &WriteResult) -> io::Result<()> {
        assert!(matches!(progress.recv().unwrap(), WriteProgress::Started));
        match progress.recv().unwrap() {
            WriteProgress::Finished(result) => result,
            WriteProgress::Started => panic!("Frame started twice"),
        }
    }

    #[tokio::test]
    async fn test_read_loop_reassembles_split_reads() {
        let bytes = frame(r#"{"type":"start_signal","payload":""}"#);
        let reader = tokio_test::io::Builder::new()
            .read(&bytes[..2])
            .read(&bytes[2..5])
            .read(&bytes[5..])
            .build();

        let (producer, mut consumer) = inbound_queue();
        let token = CancellationToken::new();

        let outcome = read_loop(reader, &producer, &token, 64).await;

        assert!(matches!(outcome, ReadOutcome::PeerClosed));
        assert_eq!(
            consumer.drain_available(),
            vec![r#"{"type":"start_signal","payload":""}"#]
        );
    }

    #[tokio::test]
    async fn test_read_loop_reports_truncated_prefix() {
        let reader = tokio_test::io::Builder::new().read(&[0, 0]).build();

        let (producer, mut consumer) = inbound_queue();
        let token = CancellationToken::new();

        let outcome = read_loop(reader, &producer, &token, 64).await;

        assert!(matches!(outcome, ReadOutcome::Truncated { buffered: 2 }));
        assert!(consumer.drain_available().is_empty());
    }

    #[tokio::test]
    async fn test_read_loop_skips_bad_prefix_and_bad_utf8() {
        let mut bytes = vec![0, 0, 0, 0];
        bytes.extend(encode_frame(&[0xff, 0xfe]).unwrap());
        bytes.extend(frame("kept"));
        let reader = tokio_test::io::Builder::new().read(&bytes).build();

        let (producer, mut consumer) = inbound_queue();
        let token = CancellationToken::new();

        let outcome = read_loop(reader, &producer, &token, 4096).await;

        assert!(matches!(outcome, ReadOutcome::PeerClosed));
        assert_eq!(consumer.drain_available(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_read_loop_propagates_read_error() {
        let reader = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let (producer, _consumer) = inbound_queue();
        let token = CancellationToken::new();

        match read_loop(reader, &producer, &token, 64).await {
            ReadOutcome::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("Unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_loop_stops_when_parent_cancelled() {
        let (_client, server) = tokio::io::duplex(64);
        let (producer, _consumer) = inbound_queue();
        let root = CancellationToken::new();
        let token = root.child_token();

        root.cancel();
        let outcome = read_loop(server, &producer, &token, 64).await;

        assert!(matches!(outcome, ReadOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_read_loop_wakes_on_cancel_while_idle() {
        let (_client, server) = tokio::io::duplex(64);
        let (producer, _consumer) = inbound_queue();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = read_loop(server, &producer, &token, 64).await;
        assert!(matches!(outcome, ReadOutcome::Cancelled));
    }

    #[test]
    fn test_slot_rejects_send_when_empty() {
        let slot = ConnectionSlot::default();
        assert_eq!(slot.state(), ConnectionState::Disconnected);
        assert!(matches!(
            slot.enqueue(Bytes::from_static(b"abc")),
            Err(BridgeError::NotConnected)
        ));
    }

    #[test]
    fn test_slot_attach_and_detach() {
        let slot = ConnectionSlot::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let id = slot.attach(peer(), tx, token.clone());
        assert_eq!(slot.state(), ConnectionState::Connected);
        assert_eq!(slot.peer_addr(), Some(peer()));

        slot.detach(id + 1);
        assert_eq!(slot.state(), ConnectionState::Connected);

        slot.detach(id);
        assert_eq!(slot.state(), ConnectionState::Disconnected);
        assert!(token.is_cancelled());
        assert_eq!(slot.peer_addr(), None);
    }

    #[test]
    fn test_slot_enqueue_hands_frame_to_writer() {
        let slot = ConnectionSlot::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.attach(peer(), tx, CancellationToken::new());

        let (_, progress) = slot.enqueue(Bytes::from_static(b"99")).unwrap();
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.payload, Bytes::from_static(b"99"));

        queued.done.send(WriteProgress::Started).unwrap();
        queued.done.send(WriteProgress::Finished(Ok(()))).unwrap();
        assert!(finished(&progress).is_ok());
    }

    #[tokio::test]
    async fn test_write_loop_writes_whole_frames_in_order() {
        let writer = tokio_test::io::Builder::new()
            .write(&frame("first"))
            .write(&frame("second"))
            .build();

        let slot = Arc::new(ConnectionSlot::default());
        let (tx, rx) = mpsc::unbounded_channel();

        let (done_first, progress_first) = std_mpsc::sync_channel(2);
        let (done_second, progress_second) = std_mpsc::sync_channel(2);
        tx.send(OutboundFrame {
            payload: Bytes::from_static(b"first"),
            done: done_first,
        })
        .unwrap();
        tx.send(OutboundFrame {
            payload: Bytes::from_static(b"second"),
            done: done_second,
        })
        .unwrap();
        drop(tx);

        write_loop(writer, rx, slot, 1, CancellationToken::new(), Duration::from_secs(1)).await;

        assert!(finished(&progress_first).is_ok());
        assert!(finished(&progress_second).is_ok());
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let writer = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let slot = Arc::new(ConnectionSlot::default());
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = slot.attach(peer(), tx.clone(), token.clone());

        let (done, progress) = std_mpsc::sync_channel(2);
        tx.send(OutboundFrame {
            payload: Bytes::from_static(b"lost"),
            done,
        })
        .unwrap();
        drop(tx);

        write_loop(writer, rx, Arc::clone(&slot), id, token.clone(), Duration::from_secs(1)).await;

        let error = finished(&progress).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
        assert!(token.is_cancelled());
        assert_eq!(slot.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_write() {
        // The peer end is never read, so a large frame cannot complete.
        let (local, _peer) = tokio::io::duplex(1024);
        let slot = Arc::new(ConnectionSlot::default());
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = slot.attach(peer(), tx.clone(), token.clone());

        let (done, progress) = std_mpsc::sync_channel(2);
        tx.send(OutboundFrame {
            payload: Bytes::from(vec![b'x'; 1 << 20]),
            done,
        })
        .unwrap();

        let writer = tokio::spawn(write_loop(
            local,
            rx,
            Arc::clone(&slot),
            id,
            token.clone(),
            Duration::from_secs(30),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        token.cancel();
        writer.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(finished(&progress).unwrap_err().kind(), io::ErrorKind::NotConnected);
    }
}
