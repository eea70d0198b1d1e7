//! Simulated board: the peer side of the link protocol.
//!
//! Behaves like the board firmware closely enough to exercise a
//! [`PeerLink`](crate::link::PeerLink) without hardware:
//!
//! - serves one controller at a time, accepting the next once it leaves;
//! - answers `{"type":"ping"}` with `{"type":"pong"}`;
//! - applies `{"set": {...}}` and acknowledges every key with
//!   `{"status": "set: <key> -> <value>"}`;
//! - answers `{"get": ...}` with `{"settings": {...}}`;
//! - logs and skips malformed frames.
//!
//! Tests can also push arbitrary frames to the controller and force the
//! current connection closed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{DEFAULT_READ_BUFFER_SIZE, PING_TYPE, SET_FIELD};
use crate::link::framing::{self, FrameReader, Message};

/// Counters and applied settings, shared with the serving task.
#[derive(Debug)]
struct BoardState {
    settings: StdMutex<Message>,
    /// Connections accepted so far; watchable so tests can await an accept.
    connections: watch::Sender<usize>,
    pings: AtomicUsize,
    dropped_frames: AtomicUsize,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            settings: StdMutex::new(Message::new()),
            connections: watch::Sender::new(0),
            pings: AtomicUsize::new(0),
            dropped_frames: AtomicUsize::new(0),
        }
    }
}

/// A running simulated board.
///
/// The accept loop runs until [`shutdown`](Self::shutdown) is called or the
/// value is dropped.
#[derive(Debug)]
pub struct SimulatedBoard {
    local_addr: SocketAddr,
    state: Arc<BoardState>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    kick_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
    accept_handle: JoinHandle<()>,
}

impl SimulatedBoard {
    /// Bind a listener on `addr` and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(BoardState::default());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kick_tx, kick_rx) = watch::channel(0);
        let shutdown = CancellationToken::new();

        log::info!("[Board] Listening on {}", local_addr);

        let accept_handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            outbound_rx,
            kick_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            state,
            outbound_tx,
            kick_tx,
            shutdown,
            accept_handle,
        })
    }

    /// Address the board is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Settings applied so far.
    pub fn settings(&self) -> Message {
        self.state.settings.lock().expect("settings lock poisoned").clone()
    }

    /// Number of controller connections accepted.
    pub fn connections_accepted(&self) -> usize {
        *self.state.connections.borrow()
    }

    /// Wait until at least `count` connections have been accepted.
    pub async fn accepted(&self, count: usize) {
        let mut connections = self.state.connections.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = connections.wait_for(|accepted| *accepted >= count).await;
    }

    /// Number of heartbeat pings received.
    pub fn pings_received(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Number of malformed frames received and skipped.
    pub fn frames_dropped(&self) -> usize {
        self.state.dropped_frames.load(Ordering::SeqCst)
    }

    /// Queue a message for the connected controller.
    pub fn push(&self, message: &Message) {
        self.push_raw(framing::encode(message));
    }

    /// Queue raw bytes for the connected controller, unframed.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        if self.outbound_tx.send(bytes).is_err() {
            log::warn!("[Board] Accept loop gone, dropping outbound bytes");
        }
    }

    /// Close the current controller connection. The board keeps listening.
    ///
    /// A request made before the accept loop has picked up the connection
    /// applies to that connection as soon as it is served.
    pub fn drop_connection(&self) {
        self.kick_tx.send_modify(|kicks| *kicks += 1);
    }

    /// Stop accepting and close the current connection.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Err(e) = (&mut self.accept_handle).await {
            log::error!("[Board] Accept loop failed: {e}");
        }
    }
}

impl Drop for SimulatedBoard {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accept loop. Serves connections strictly one after another.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<BoardState>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut kick_rx: watch::Receiver<u64>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                state.connections.send_modify(|accepted| *accepted += 1);
                log::info!("[Board] Controller connected: {}", peer);
                serve(stream, &state, &mut outbound_rx, &mut kick_rx, &shutdown).await;
                log::info!("[Board] Controller disconnected: {}", peer);
            }
            Err(e) => {
                log::warn!("[Board] Accept failed: {e}");
            }
        }
    }

    log::debug!("[Board] Accept loop exiting");
}

/// Serve one controller until it leaves, is kicked, or the board stops.
async fn serve(
    stream: TcpStream,
    state: &BoardState,
    outbound_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    kick_rx: &mut watch::Receiver<u64>,
    shutdown: &CancellationToken,
) {
    if kick_rx.has_changed().unwrap_or(false) {
        kick_rx.mark_unchanged();
        log::info!("[Board] Dropping controller connection");
        return;
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, DEFAULT_READ_BUFFER_SIZE);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = kick_rx.changed() => {
                log::info!("[Board] Dropping controller connection");
                return;
            }
            Some(bytes) = outbound_rx.recv() => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    log::warn!("[Board] Write failed: {e}");
                    return;
                }
            }
            result = reader.next_message() => match result {
                Ok(message) => {
                    for reply in respond(state, &message) {
                        if let Err(e) = write_message(&mut write_half, &reply).await {
                            log::warn!("[Board] Write failed: {e}");
                            return;
                        }
                    }
                }
                Err(e) if e.is_recoverable() => {
                    state.dropped_frames.fetch_add(1, Ordering::SeqCst);
                    log::warn!("[Board] Dropping frame: {e}");
                }
                Err(_) => return,
            },
        }
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &Message) -> io::Result<()> {
    writer.write_all(&framing::encode(message)).await
}

/// Replies the firmware would send for `message`.
fn respond(state: &BoardState, message: &Message) -> Vec<Message> {
    if framing::message_type(message) == Some(PING_TYPE) {
        state.pings.fetch_add(1, Ordering::SeqCst);
        return vec![framing::pong()];
    }

    if let Some(update) = message.get(SET_FIELD) {
        let Some(update) = update.as_object() else {
            return vec![status(format!("set: invalid payload {update}"))];
        };
        let mut settings = state.settings.lock().expect("settings lock poisoned");
        return update
            .iter()
            .map(|(key, value)| {
                settings.insert(key.clone(), value.clone());
                status(format!("set: {key} -> {}", display_value(value)))
            })
            .collect();
    }

    if message.contains_key("get") {
        let settings = state.settings.lock().expect("settings lock poisoned").clone();
        return vec![object(json!({ "settings": settings }))];
    }

    log::debug!("[Board] Ignoring message: {}", Value::Object(message.clone()));
    Vec::new()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn status(text: String) -> Message {
    object(json!({ "status": text }))
}

fn object(value: Value) -> Message {
    match value {
        Value::Object(map) => map,
        _ => Message::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(value: Value) -> Message {
        object(value)
    }

    #[test]
    fn test_ping_gets_pong() {
        let state = BoardState::default();
        let replies = respond(&state, &framing::ping());
        assert_eq!(replies, vec![framing::pong()]);
        assert_eq!(state.pings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_applies_and_acknowledges_each_key() {
        let state = BoardState::default();
        let replies = respond(&state, &msg(json!({"set": {"pwm01": 128, "mode": "strobe"}})));
        assert_eq!(
            replies,
            vec![
                msg(json!({"status": "set: mode -> strobe"})),
                msg(json!({"status": "set: pwm01 -> 128"})),
            ]
        );
        let settings = state.settings.lock().unwrap();
        assert_eq!(settings.get("pwm01"), Some(&json!(128)));
        assert_eq!(settings.get("mode"), Some(&json!("strobe")));
    }

    #[test]
    fn test_set_with_non_object_payload() {
        let state = BoardState::default();
        let replies = respond(&state, &msg(json!({"set": 5})));
        assert_eq!(replies, vec![msg(json!({"status": "set: invalid payload 5"}))]);
        assert!(state.settings.lock().unwrap().is_empty());
    }

    #[test]
    fn test_get_returns_current_settings() {
        let state = BoardState::default();
        respond(&state, &msg(json!({"set": {"pwm02": 3}})));
        let replies = respond(&state, &msg(json!({"get": "all"})));
        assert_eq!(replies, vec![msg(json!({"settings": {"pwm02": 3}}))]);
    }

    #[test]
    fn test_unknown_message_ignored() {
        let state = BoardState::default();
        assert!(respond(&state, &msg(json!({"type": "status"}))).is_empty());
    }

    #[tokio::test]
    async fn test_drop_requested_before_accept_applies_to_that_connection() {
        use tokio::io::AsyncReadExt;
        use tokio::time::{timeout, Duration};

        let board = SimulatedBoard::bind("127.0.0.1:0").await.unwrap();
        let mut first = TcpStream::connect(board.local_addr()).await.unwrap();
        board.drop_connection();

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), first.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        board.accepted(1).await;

        // The request was used up; the next controller is served normally
        let second = TcpStream::connect(board.local_addr()).await.unwrap();
        let (read_half, _write_half) = second.into_split();
        let mut reader = FrameReader::new(read_half, DEFAULT_READ_BUFFER_SIZE);
        board.push(&msg(json!({"hello": 1})));
        let message = timeout(Duration::from_secs(5), reader.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, msg(json!({"hello": 1})));
        assert_eq!(board.connections_accepted(), 2);

        board.shutdown().await;
    }
}
