use crate::error::ClientError;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use shared::{
    Command, Decoded, Envelope, FrameCodec, GazePoint, InboundKind, OutboundKind, ProtocolError,
    START_SIGNAL_ACK,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// A message received from the bridge server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Ack(String),
    Command(Command),
    Gaze(GazePoint),
    /// A type this controller does not understand, or a payload that did not parse.
    Unknown { kind: String, payload: String },
}

impl ControllerEvent {
    pub fn from_envelope(envelope: Envelope) -> Self {
        let parsed = match envelope.kind.parse::<OutboundKind>() {
            Ok(OutboundKind::Ack) => Some(ControllerEvent::Ack(envelope.payload.clone())),
            Ok(OutboundKind::Command) => envelope.payload.parse().ok().map(ControllerEvent::Command),
            Ok(OutboundKind::Gaze) => GazePoint::from_json(&envelope.payload)
                .ok()
                .map(ControllerEvent::Gaze),
            Err(_) => None,
        };

        parsed.unwrap_or_else(|| ControllerEvent::Unknown {
            kind: envelope.kind,
            payload: envelope.payload,
        })
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

/// Both halves of one live connection.
struct Link {
    writer: FrameWriter,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    /// Cleared by the reader when the stream ends and by a failed send.
    connected: Arc<AtomicBool>,
    reader_handle: JoinHandle<()>,
}

impl Link {
    fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(read_events(reader, event_tx, Arc::clone(&connected)));

        Self {
            writer: FramedWrite::new(Box::new(writer) as BoxedWriter, FrameCodec::new()),
            events: event_rx,
            connected,
            reader_handle,
        }
    }
}

/// Controller-side peer of the bridge server.
///
/// Outbound frames are written whole under a lock, so `send` may be called
/// from several tasks at once. Inbound frames are decoded by a background
/// task and handed out by [`next_event`](Self::next_event).
///
/// A client created by [`connect`](Self::connect) or
/// [`connect_with_retry`](Self::connect_with_retry) remembers where it
/// connected and can [`reconnect`](Self::reconnect), or stay connected
/// across server restarts with [`run`](Self::run).
pub struct ControllerClient {
    /// Where to redial after the connection is lost.
    addr: Option<String>,
    peer: Option<SocketAddr>,
    writer: Mutex<Option<FrameWriter>>,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    /// Events that arrived while waiting for something else.
    backlog: VecDeque<ControllerEvent>,
    reader_handle: JoinHandle<()>,
}

impl ControllerClient {
    /// Connects to the bridge server once.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Self::from_tcp(stream);
        client.addr = client.peer.map(|peer| peer.to_string());
        Ok(client)
    }

    /// Connects, retrying every `delay` until it succeeds or `max_attempts`
    /// attempts have failed. `None` retries forever.
    pub async fn connect_with_retry(
        addr: &str,
        delay: Duration,
        max_attempts: Option<u32>,
    ) -> Result<Self, ClientError> {
        let stream = dial(addr, delay, max_attempts).await?;
        let mut client = Self::from_tcp(stream);
        client.addr = Some(addr.to_string());
        Ok(client)
    }

    /// Wraps an already connected stream. Such a client cannot reconnect.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_link(Link::spawn(reader, writer))
    }

    fn from_tcp(stream: TcpStream) -> Self {
        let peer = prepare(&stream);
        let (reader, writer) = stream.into_split();
        let mut client = Self::from_link(Link::spawn(reader, writer));
        client.peer = peer;
        client
    }

    fn from_link(link: Link) -> Self {
        Self {
            addr: None,
            peer: None,
            writer: Mutex::new(Some(link.writer)),
            connected: link.connected,
            events: link.events,
            backlog: VecDeque::new(),
            reader_handle: link.reader_handle,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// True until the server closes the stream, a send fails, or
    /// [`shutdown`](Self::shutdown) is called.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Replaces the current connection with a fresh one to the remembered
    /// address, retrying every `delay`.
    ///
    /// Events already received are kept. Fails with `Closed` for a client
    /// built with [`from_stream`](Self::from_stream).
    pub async fn reconnect(
        &mut self,
        delay: Duration,
        max_attempts: Option<u32>,
    ) -> Result<(), ClientError> {
        let Some(addr) = self.addr.clone() else {
            return Err(ClientError::Closed);
        };

        let stream = dial(&addr, delay, max_attempts).await?;
        let peer = prepare(&stream);
        let (reader, writer) = stream.into_split();
        let link = Link::spawn(reader, writer);

        self.reader_handle.abort();
        self.connected.store(false, Ordering::SeqCst);

        self.peer = peer;
        *self.writer.get_mut() = Some(link.writer);
        self.connected = link.connected;
        self.events = link.events;
        self.reader_handle = link.reader_handle;
        Ok(())
    }

    /// Hands every event to `handler` and redials after the connection is
    /// lost, waiting `delay` between attempts, until `token` is cancelled.
    ///
    /// Returns `Ok` on cancellation. A client that cannot reconnect returns
    /// `Closed` once its stream ends.
    pub async fn run<F>(
        &mut self,
        token: &CancellationToken,
        delay: Duration,
        mut handler: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(ControllerEvent),
    {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = self.next_event() => event,
            };

            if let Some(event) = event {
                handler(event);
                continue;
            }

            if self.addr.is_none() {
                return Err(ClientError::Closed);
            }
            warn!("Lost connection to the bridge server, reconnecting...");
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = self.reconnect(delay, None) => result?,
            }
        }
    }

    /// Sends one envelope of the given type.
    ///
    /// A failed write marks the client disconnected; later sends fail with
    /// `NotConnected` until it reconnects.
    pub async fn send(&self, kind: InboundKind, payload: &str) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let frame = Envelope::new(kind.as_str(), payload).to_bytes()?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let result = writer.send(frame).await;
        match result {
            Ok(()) => {
                debug!("Sent '{}'", kind);
                Ok(())
            }
            Err(ProtocolError::Io(e)) => {
                warn!("Failed to send '{}': {}", kind, e);
                self.connected.store(false, Ordering::SeqCst);
                *guard = None;
                Err(ClientError::Io(e))
            }
            Err(e) => Err(ClientError::Protocol(e)),
        }
    }

    pub async fn send_start_signal(&self) -> Result<(), ClientError> {
        self.send(InboundKind::StartSignal, "").await
    }

    pub async fn send_subtitle(&self, text: &str) -> Result<(), ClientError> {
        self.send(InboundKind::Subtitle, text).await
    }

    pub async fn send_selection_confirmed(&self) -> Result<(), ClientError> {
        self.send(InboundKind::SelectionConfirmed, "").await
    }

    /// Waits for the next message from the server. `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let event = self.events.recv().await;
        if event.is_none() {
            self.connected.store(false, Ordering::SeqCst);
        }
        event
    }

    /// Sends a start signal and waits for the server to acknowledge it.
    ///
    /// Other messages arriving in the meantime are kept for
    /// [`next_event`](Self::next_event).
    pub async fn handshake(&mut self, timeout: Duration) -> Result<(), ClientError> {
        self.send_start_signal().await?;

        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(ControllerEvent::Ack(id)) if id == START_SIGNAL_ACK => return Ok(()),
                    Some(other) => self.backlog.push_back(other),
                    None => return Err(ClientError::Closed),
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => {
                if result.is_ok() {
                    info!("Start signal acknowledged by the bridge server");
                }
                result
            }
            Err(_) => {
                warn!("No acknowledgement within {:?}", timeout);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Flushes and closes the write side. Later sends fail with `NotConnected`.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        writer.close().await?;
        Ok(())
    }
}

impl Drop for ControllerClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn prepare(stream: &TcpStream) -> Option<SocketAddr> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let peer = stream.peer_addr().ok();
    if let Some(peer) = peer {
        info!("Connected to bridge server at {}", peer);
    }
    peer
}

/// Opens a TCP stream to `addr`, retrying every `delay`.
async fn dial(
    addr: &str,
    delay: Duration,
    max_attempts: Option<u32>,
) -> Result<TcpStream, ClientError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if max_attempts.map_or(false, |max| attempt >= max) {
                    warn!("Giving up on {} after {} attempts: {}", addr, attempt, e);
                    return Err(e.into());
                }
                warn!(
                    "Connection to {} failed ({}), retrying in {:?}...",
                    addr, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}

fn parse_frame(bytes: &Bytes) -> Result<Envelope, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
    Envelope::from_json(text).map_err(|e| e.to_string())
}

/// Decodes frames from `reader` into events until the stream ends, then
/// clears `connected`.
async fn read_events<R>(
    reader: R,
    events: mpsc::UnboundedSender<ControllerEvent>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new());

    loop {
        let bytes = match frames.next().await {
            None => {
                info!("Bridge server closed the connection");
                break;
            }
            Some(Ok(Decoded::Frame(bytes))) => bytes,
            Some(Ok(Decoded::Malformed { length })) => {
                warn!("Skipping frame with invalid length prefix {}", length);
                continue;
            }
            Some(Err(ProtocolError::Truncated { buffered })) => {
                warn!(
                    "Bridge server closed the connection mid-frame, {} bytes discarded",
                    buffered
                );
                break;
            }
            Some(Err(e)) => {
                warn!("Error receiving from bridge server: {}", e);
                break;
            }
        };

        trace!("Received {} byte frame", bytes.len());
        let envelope = match parse_frame(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Skipping undecodable frame: {}", e);
                continue;
            }
        };

        if events.send(ControllerEvent::from_envelope(envelope)).is_err() {
            break;
        }
    }

    connected.store(false, Ordering::SeqCst);
}
