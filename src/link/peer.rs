//! Connection state machine and send path for [`PeerLink`].
//!
//! # Lifecycle
//!
//! ```text
//!  Disconnected ──connect()──► Connecting ──socket up──► Connected
//!                                 ▲   │                     │
//!                                 │   └─fail: sleep, retry  │ transport failure
//!                                 └───── reconnect task ◄───┘
//!
//!  any state ──disconnect()──► Disconnected   (no further retries)
//! ```
//!
//! Every transition happens while holding the control mutex. Each
//! `connect()` call gets its own stop token; each session gets a child of
//! it, so cancelling the stop token reaches every loop and retry sleep.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::framing::{self, Message};
use super::session;
use super::{LinkError, LinkState, PeerEndpoint};
use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_BYTES, SET_FIELD};

/// Consumer of inbound application messages.
///
/// Runs on the receive task; a slow handler delays the next frame. A
/// panic inside the handler is caught and logged.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Handle to a resilient framed connection with one board.
///
/// Dropping the handle stops every background task the link started. Wrap
/// it in an `Arc` to share it between tasks.
pub struct PeerLink {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("endpoint", &self.inner.endpoint.address())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    /// Create a disconnected link to `endpoint` with no message handler.
    pub fn new(endpoint: PeerEndpoint) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                state,
                writer: Mutex::new(None),
                handler: StdRwLock::new(None),
                control: Mutex::new(Control::default()),
                reconnect_task: StdMutex::new(None),
                next_generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a disconnected link that delivers inbound messages to `handler`.
    pub fn with_handler<F>(endpoint: PeerEndpoint, handler: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let link = Self::new(endpoint);
        link.set_message_handler(handler);
        link
    }

    /// Endpoint this link connects to.
    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.inner.endpoint
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Whether the link is in [`LinkState::Connected`].
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Install the consumer of inbound non-heartbeat messages.
    ///
    /// Replaces any previous handler; the next dispatched message goes to
    /// the new one.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        *self.inner.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    /// Remove the message handler. Inbound messages are dropped until a new
    /// one is installed.
    pub fn clear_message_handler(&self) {
        *self.inner.handler.write().expect("handler lock poisoned") = None;
    }

    /// Connect, retrying with a fixed delay until it works.
    ///
    /// Resolves once the link is [`LinkState::Connected`], or early if
    /// [`disconnect`](Self::disconnect) is called meanwhile. Connect
    /// failures are logged and retried, never returned. If the link is
    /// already connected this returns immediately; if another task is
    /// already connecting it waits for that attempt to settle.
    pub async fn connect(&self) {
        let stop = {
            let mut control = self.inner.control.lock().await;
            match self.state() {
                LinkState::Connected => return,
                LinkState::Connecting => {
                    let mut state_rx = self.inner.state.subscribe();
                    drop(control);
                    let _ = state_rx.wait_for(|state| *state != LinkState::Connecting).await;
                    return;
                }
                LinkState::Disconnected => {}
            }
            let stop = self.inner.shutdown.child_token();
            control.stop = Some(stop.clone());
            self.inner.set_state(LinkState::Connecting);
            stop
        };

        self.inner.establish(&stop).await;
    }

    /// Stop all background work and close the socket.
    ///
    /// Suppresses auto-reconnect until [`connect`](Self::connect) is called
    /// again. When this returns, no loop or retry task started by the link
    /// is still running.
    pub async fn disconnect(&self) {
        {
            let mut control = self.inner.control.lock().await;
            if let Some(stop) = control.stop.take() {
                stop.cancel();
            }
            let session = control.session.take();
            self.inner.teardown(session).await;
            self.inner.set_state(LinkState::Disconnected);
        }

        let pending = self
            .inner
            .reconnect_task
            .lock()
            .expect("reconnect slot poisoned")
            .take();
        if let Some((_, handle)) = pending {
            if let Err(e) = handle.await {
                log::error!("[{}] Reconnect task failed: {e}", self.inner.endpoint.name);
            }
        }

        log::info!("[{}] Disconnected", self.inner.endpoint.name);
    }

    /// Send one message as a single frame.
    ///
    /// # Errors
    ///
    /// - [`LinkError::NotConnected`] if the link is not connected.
    /// - [`LinkError::FrameTooLarge`] if the encoded payload exceeds
    ///   `MAX_FRAME_BYTES`.
    /// - [`LinkError::ConnectionLost`] if the write failed; the link has
    ///   already started reconnecting.
    pub async fn send(&self, message: &Message) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let frame = framing::encode(message);
        let length = frame.len() - FRAME_HEADER_LEN;
        if length > MAX_FRAME_BYTES {
            return Err(LinkError::FrameTooLarge { length });
        }

        self.inner.write_frame(None, &frame).await
    }

    /// Push a settings update to the board as `{"set": settings}`.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn update_settings(&self, settings: Message) -> Result<(), LinkError> {
        let mut message = Message::new();
        message.insert(SET_FIELD.to_string(), serde_json::Value::Object(settings));
        self.send(&message).await
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// State shared between the handle and its background tasks.
pub(super) struct Inner {
    endpoint: PeerEndpoint,
    state: watch::Sender<LinkState>,
    writer: Mutex<Option<SessionWriter>>,
    handler: StdRwLock<Option<MessageHandler>>,
    control: Mutex<Control>,
    /// Reconnect task in flight, tagged with the session generation that failed.
    reconnect_task: StdMutex<Option<(u64, JoinHandle<()>)>>,
    next_generation: AtomicU64,
    /// Cancelled when the owning [`PeerLink`] is dropped.
    shutdown: CancellationToken,
}

/// Transition bookkeeping, guarded by `Inner::control`.
#[derive(Default)]
struct Control {
    stop: Option<CancellationToken>,
    session: Option<Session>,
}

/// Background tasks of one connected session.
struct Session {
    generation: u64,
    cancel: CancellationToken,
    receive: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// Write half of the live socket.
struct SessionWriter {
    generation: u64,
    cancel: CancellationToken,
    half: OwnedWriteHalf,
}

impl Inner {
    pub(super) fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("[{}] Link {} -> {}", self.endpoint.name, previous, state);
        }
    }

    /// Connect loop. Returns once a session is installed or `stop` fires.
    async fn establish(self: &Arc<Self>, stop: &CancellationToken) {
        let address = self.endpoint.address();
        let name = &self.endpoint.name;

        loop {
            log::info!("[{}] Attempting connection to {}", name, address);

            let attempt = tokio::select! {
                _ = stop.cancelled() => return,
                result = tokio::time::timeout(
                    self.endpoint.connect_timeout,
                    TcpStream::connect(address.as_str()),
                ) => result,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    if self.install_session(stream, stop).await {
                        log::info!("[{}] Connection to {} successful", name, address);
                    }
                    return;
                }
                Ok(Err(e)) => log::info!(
                    "[{}] Connection failed ({e}), retrying in {:?}",
                    name,
                    self.endpoint.reconnect_interval
                ),
                Err(_) => log::info!(
                    "[{}] Connection timed out after {:?}, retrying in {:?}",
                    name,
                    self.endpoint.connect_timeout,
                    self.endpoint.reconnect_interval
                ),
            }

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.endpoint.reconnect_interval) => {}
            }
        }
    }

    /// Install a fresh socket and spawn its loops.
    ///
    /// Returns `false` (dropping the socket) if `stop` fired while the
    /// connect was in flight.
    async fn install_session(self: &Arc<Self>, stream: TcpStream, stop: &CancellationToken) -> bool {
        let mut control = self.control.lock().await;
        if stop.is_cancelled() {
            return false;
        }

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[{}] Could not set TCP_NODELAY: {e}", self.endpoint.name);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = stop.child_token();
        let (read_half, write_half) = stream.into_split();

        *self.writer.lock().await = Some(SessionWriter {
            generation,
            cancel: cancel.clone(),
            half: write_half,
        });

        let receive = tokio::spawn(session::receive_loop(
            Arc::clone(self),
            generation,
            read_half,
            cancel.clone(),
        ));
        let heartbeat = tokio::spawn(session::heartbeat_loop(
            Arc::clone(self),
            generation,
            cancel.clone(),
        ));

        control.session = Some(Session {
            generation,
            cancel,
            receive,
            heartbeat,
        });
        self.set_state(LinkState::Connected);
        true
    }

    /// Stop a session's loops, wait for them, and close the socket.
    ///
    /// Closing an already closed writer is a no-op.
    async fn teardown(&self, session: Option<Session>) {
        if let Some(session) = session {
            session.cancel.cancel();
            for handle in [session.receive, session.heartbeat] {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        log::error!("[{}] Session task panicked: {e}", self.endpoint.name);
                    }
                }
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.half.shutdown().await {
                log::debug!("[{}] Socket shutdown: {e}", self.endpoint.name);
            }
        }
    }

    /// Write one encoded frame as a contiguous byte sequence.
    ///
    /// With `Some(generation)` the write only happens on that session's
    /// socket. An I/O error is reported as a transport failure.
    pub(super) async fn write_frame(
        self: &Arc<Self>,
        generation: Option<u64>,
        frame: &[u8],
    ) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        if generation.is_some_and(|expected| expected != writer.generation) {
            return Err(LinkError::NotConnected);
        }

        let cancel = writer.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(LinkError::ConnectionLost(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "link closed during write",
                )));
            }
            result = writer.half.write_all(frame) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let failed = writer.generation;
                drop(guard);
                log::warn!("[{}] Write failed: {e}", self.endpoint.name);
                self.report_failure(failed);
                Err(LinkError::ConnectionLost(e))
            }
        }
    }

    /// Hand an inbound message to the current handler, if any.
    ///
    /// A panicking handler loses that one message; the receive loop keeps
    /// running.
    pub(super) fn dispatch(&self, message: Message) {
        let handler = self.handler.read().expect("handler lock poisoned").clone();
        let Some(handler) = handler else {
            log::debug!("[{}] No message handler, dropping message", self.endpoint.name);
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
            log::error!("[{}] Message handler panicked, message dropped", self.endpoint.name);
        }
    }

    /// Start recovery for a failed session.
    ///
    /// Reports for a session already being recovered, or already replaced,
    /// do not start a second task.
    pub(super) fn report_failure(self: &Arc<Self>, generation: u64) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut slot = self.reconnect_task.lock().expect("reconnect slot poisoned");
        if slot.as_ref().is_some_and(|(recovering, _)| *recovering >= generation) {
            return;
        }

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.recover(generation).await });
        *slot = Some((generation, handle));
    }

    /// Replace a failed session: tear it down, then reconnect.
    async fn recover(self: Arc<Self>, generation: u64) {
        let stop = {
            let mut control = self.control.lock().await;
            let Some(stop) = control.stop.clone() else {
                return;
            };
            if stop.is_cancelled() {
                return;
            }
            if control.session.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }

            let session = control.session.take();
            self.teardown(session).await;
            self.set_state(LinkState::Disconnected);
            log::warn!("[{}] Disconnected. Reconnecting...", self.endpoint.name);
            self.set_state(LinkState::Connecting);
            stop
        };

        self.establish(&stop).await;
    }
}
