//! Listener lifecycle and the outbound send path.
//!
//! [`BridgeServer`] owns the listening socket and one dedicated background
//! thread. That thread hosts a single-threaded tokio runtime which blocks on
//! `accept`, then serves the accepted client until it goes away, then
//! accepts again. Only one client is served at a time: while a connection is
//! active, further connection attempts wait in the listen backlog.
//!
//! The host drives delivery itself by calling [`BridgeServer::drain`] on its
//! own schedule, and may call the `send_*` methods from any thread.

use crate::config::ServerConfig;
use crate::connection::{
    read_loop, write_loop, ConnectionSlot, ConnectionState, ReadOutcome, WriteProgress,
    WriteResult,
};
use crate::dispatcher::{Dispatcher, DrainReport, Subscription};
use crate::error::BridgeError;
use crate::queue::{inbound_queue, InboundProducer};
use log::{debug, error, info, warn};
use shared::{Command, Envelope, GazePoint, InboundKind, OutboundKind};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Extra time a sender waits beyond the write timeout for the writer to report.
const SEND_GRACE: Duration = Duration::from_millis(500);

/// State shared between the host-facing API and the network thread.
struct Shared {
    slot: Arc<ConnectionSlot>,
    inbound: InboundProducer,
}

struct Worker {
    handle: JoinHandle<()>,
    /// Root of every connection token; cancelled by `stop`.
    token: CancellationToken,
    local_addr: SocketAddr,
}

/// How waiting on a queued frame ended.
#[derive(Debug)]
enum WriteWait {
    Finished(io::Result<()>),
    /// The writer dequeued the frame but did not report back in time.
    TimedOut,
    /// The writer went away without reporting.
    Dropped,
}

/// Waits for the writer to dequeue a frame, then at most `limit` for it to
/// finish.
///
/// Frames queued ahead are each bounded by the writer's own timeout and by
/// cancellation, so the first wait cannot outlive the connection.
fn await_write(progress: &WriteResult, limit: Duration) -> WriteWait {
    match progress.recv() {
        Ok(WriteProgress::Started) => {}
        Ok(WriteProgress::Finished(result)) => return WriteWait::Finished(result),
        Err(_) => return WriteWait::Dropped,
    }

    match progress.recv_timeout(limit) {
        Ok(WriteProgress::Finished(result)) => WriteWait::Finished(result),
        Ok(WriteProgress::Started) => WriteWait::Dropped,
        Err(RecvTimeoutError::Timeout) => WriteWait::TimedOut,
        Err(RecvTimeoutError::Disconnected) => WriteWait::Dropped,
    }
}

/// Single-client message-framing TCP server.
pub struct BridgeServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    worker: Mutex<Option<Worker>>,
}

impl BridgeServer {
    pub fn new(config: ServerConfig) -> Self {
        let (producer, consumer) = inbound_queue();

        Self {
            config,
            shared: Arc::new(Shared {
                slot: Arc::new(ConnectionSlot::default()),
                inbound: producer,
            }),
            dispatcher: Dispatcher::new(consumer),
            worker: Mutex::new(None),
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listening socket on all interfaces and starts the network
    /// thread. Returns the bound address.
    ///
    /// Calling this while the server is running does nothing and returns the
    /// current address. A bind failure is returned and nothing is started.
    pub fn start(&self) -> Result<SocketAddr, BridgeError> {
        let mut worker = self.lock_worker();

        if let Some(running) = worker.as_ref() {
            if !running.handle.is_finished() {
                debug!("Bridge server already running on {}", running.local_addr);
                return Ok(running.local_addr);
            }
        }
        if let Some(stale) = worker.take() {
            warn!("Network thread exited on its own, restarting");
            stale.token.cancel();
            let _ = stale.handle.join();
        }

        let port = self.config.port;
        let bind_error = |source: io::Error| BridgeError::Bind { port, source };

        let listener =
            std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;

        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let loop_token = token.clone();
        let handle = thread::Builder::new()
            .name("bridge-net".to_string())
            .spawn(move || {
                runtime.block_on(accept_loop(listener, shared, loop_token, config));
            })
            .map_err(BridgeError::Spawn)?;

        info!(
            "Bridge server started on {}. Waiting for a client to connect...",
            local_addr
        );

        *worker = Some(Worker {
            handle,
            token,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stops the network thread and closes every socket.
    ///
    /// Returns once the thread has been joined; nothing is read or written
    /// afterwards, and a write blocked on a slow peer is abandoned. Safe to
    /// call repeatedly. [`start`](Self::start) may be called again later.
    pub fn stop(&self) {
        let mut worker = self.lock_worker();
        let Some(running) = worker.take() else {
            self.shared.slot.close_all();
            return;
        };

        info!("Cleaning up network resources...");
        running.token.cancel();

        if running.handle.join().is_err() {
            error!("Network thread panicked");
        }
        self.shared.slot.close_all();
        info!("Bridge server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker()
            .as_ref()
            .map_or(false, |worker| !worker.handle.is_finished())
    }

    /// Address of the listening socket while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_worker().as_ref().map(|worker| worker.local_addr)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.slot.state()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.slot.peer_addr()
    }

    /// Registers a callback for one inbound message type.
    pub fn subscribe<F>(&self, kind: InboundKind, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, callback)
    }

    /// Delivers every message received so far to its subscribers.
    pub fn drain(&self) -> DrainReport {
        self.dispatcher.drain()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Sends one envelope to the connected client.
    ///
    /// Blocks until the frame has been written. Frames from other callers
    /// that were queued first are written first; once this frame is being
    /// written the wait is bounded by the configured write timeout. A failed
    /// or timed-out write closes the connection.
    pub fn send(&self, kind: OutboundKind, payload: &str) -> Result<(), BridgeError> {
        let bytes = Envelope::new(kind.as_str(), payload).to_bytes()?;

        let (id, progress) = match self.shared.slot.enqueue(bytes) {
            Ok(queued) => queued,
            Err(e) => {
                debug!("No client connected, dropping '{}'", kind);
                return Err(e);
            }
        };

        match await_write(&progress, self.config.write_timeout + SEND_GRACE) {
            WriteWait::Finished(Ok(())) => {
                debug!("Sent '{}'", kind);
                Ok(())
            }
            WriteWait::Finished(Err(e)) => {
                warn!("Failed to send '{}': {}", kind, e);
                Err(match e.kind() {
                    io::ErrorKind::TimedOut => BridgeError::WriteTimeout,
                    io::ErrorKind::NotConnected => BridgeError::NotConnected,
                    _ => BridgeError::Write(e),
                })
            }
            WriteWait::TimedOut => {
                error!("Timed out sending '{}', dropping connection", kind);
                self.shared.slot.detach(id);
                Err(BridgeError::WriteTimeout)
            }
            WriteWait::Dropped => {
                warn!("Connection closed before '{}' was sent", kind);
                Err(BridgeError::NotConnected)
            }
        }
    }

    pub fn send_ack(&self, id: &str) -> Result<(), BridgeError> {
        self.send(OutboundKind::Ack, id)
    }

    pub fn send_command(&self, command: Command) -> Result<(), BridgeError> {
        self.send(OutboundKind::Command, command.as_str())
    }

    pub fn send_gaze(&self, point: GazePoint) -> Result<(), BridgeError> {
        let payload = point.to_json()?;
        self.send(OutboundKind::Gaze, &payload)
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Network thread body: accept, serve, repeat until `token` is cancelled.
async fn accept_loop(
    listener: std::net::TcpListener,
    shared: Arc<Shared>,
    token: CancellationToken,
    config: ServerConfig,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register listener: {}", e);
            return;
        }
    };

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                serve_connection(stream, peer, &shared, &token, &config).await;
                if token.is_cancelled() {
                    break;
                }
                info!("Waiting for a new connection...");
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(config.accept_retry_delay) => {}
                }
            }
        }
    }

    info!("Listener stopped");
}

/// Runs one client connection to completion on the network thread.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Shared,
    server_token: &CancellationToken,
    config: &ServerConfig,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let (reader, writer) = stream.into_split();
    let token = server_token.child_token();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let id = shared.slot.attach(peer, outbound_tx, token.clone());
    info!("Client connected from {}", peer);

    let writer_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        Arc::clone(&shared.slot),
        id,
        token.clone(),
        config.write_timeout,
    ));

    let outcome = read_loop(reader, &shared.inbound, &token, config.read_chunk_size).await;

    shared.slot.detach(id);
    if writer_task.await.is_err() {
        error!("Writer task for {} panicked", peer);
    }

    match outcome {
        ReadOutcome::PeerClosed => info!("Client {} disconnected", peer),
        ReadOutcome::Truncated { buffered } => info!(
            "Client {} disconnected mid-frame, {} buffered bytes discarded",
            peer, buffered
        ),
        ReadOutcome::Failed(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ) =>
        {
            info!("Client {} disconnected: {}", peer, e)
        }
        ReadOutcome::Failed(e) => warn!("Error receiving from {}: {}", peer, e),
        ReadOutcome::Cancelled if server_token.is_cancelled() => {
            debug!("Connection to {} closed for shutdown", peer)
        }
        ReadOutcome::Cancelled => info!("Connection to {} closed after a failed send", peer),
    }
}
