//! Resilient TCP link to an embedded board.
//!
//! A [`PeerLink`] keeps one framed connection to one board alive: it
//! connects with unbounded fixed-delay retry, runs a receive loop and a
//! heartbeat loop per connection, and reconnects on its own whenever the
//! transport fails. Only [`PeerLink::disconnect`] stops it.
//!
//! # Architecture
//!
//! ```text
//!  owner task                         per connected session
//! ┌─────────────────────┐            ┌──────────────────────────────┐
//! │ PeerLink            │  spawns    │ receive loop                 │
//! │  connect()          ├───────────►│  FrameReader(read half)      │
//! │  send() ──┐         │            │  pong → dropped              │
//! │  disconnect()       │            │  other → message handler     │
//! └───────────┼─────────┘            ├──────────────────────────────┤
//!             │  writer mutex        │ heartbeat loop               │
//!             └──────────┬───────────┤  {"type":"ping"} every tick  │
//!                        ▼           └──────────────┬───────────────┘
//!                  write half ◄─────────────────────┘
//! ```
//!
//! Any transport failure seen by either loop or by `send` tears the session
//! down and spawns a reconnect task. Sessions are numbered; a failure
//! reported by a session that has already been replaced is ignored.
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 BE length][UTF-8 JSON object]`
//!
//! See [`framing`] for the codec.

pub mod framing;
mod peer;
mod session;

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_NAME, DEFAULT_READ_BUFFER_SIZE,
    DEFAULT_RECONNECT_INTERVAL, MAX_FRAME_BYTES,
};

pub use framing::{FrameDecoder, FrameError, FrameReader, Message};
pub use peer::{MessageHandler, PeerLink};

/// Connection parameters for one board.
///
/// Fixed for the lifetime of a [`PeerLink`]; the link keeps its own copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Label used in log lines.
    pub name: String,
    /// Host name or IP address of the board.
    pub host: String,
    /// TCP port of the board.
    pub port: u16,
    /// Upper bound on one connect attempt.
    pub connect_timeout: Duration,
    /// Bytes requested from the socket per read.
    pub read_buffer_size: usize,
    /// Delay between failed connect attempts.
    pub reconnect_interval: Duration,
    /// Delay between heartbeat pings.
    pub heartbeat_interval: Duration,
}

impl PeerEndpoint {
    /// Endpoint for `host:port` with default timings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Set the log label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the connect attempt timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the delay between connect attempts.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the delay between heartbeat pings.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// `host:port`, as handed to the resolver.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection state of a [`PeerLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No socket and no connect attempt in progress.
    #[default]
    Disconnected,
    /// Attempting to connect, or waiting between attempts.
    Connecting,
    /// Socket live, receive and heartbeat loops running.
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Errors surfaced to callers of [`PeerLink::send`].
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link is not in [`LinkState::Connected`]. Nothing was queued.
    #[error("not connected to peer")]
    NotConnected,

    /// The write failed. The link is already reconnecting.
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] io::Error),

    /// The encoded payload exceeds what the board accepts.
    #[error("frame too large: {length} bytes (max {MAX_FRAME_BYTES})")]
    FrameTooLarge {
        /// Encoded payload size.
        length: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = PeerEndpoint::new("10.0.0.2", 5000);
        assert_eq!(endpoint.address(), "10.0.0.2:5000");
        assert_eq!(endpoint.name, "board");
        assert_eq!(endpoint.connect_timeout, Duration::from_secs(5));
        assert_eq!(endpoint.read_buffer_size, 1024);
        assert_eq!(endpoint.reconnect_interval, Duration::from_secs(5));
        assert_eq!(endpoint.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_endpoint_builders() {
        let endpoint = PeerEndpoint::new("localhost", 1)
            .with_name("lights")
            .with_connect_timeout(Duration::from_millis(200))
            .with_read_buffer_size(16)
            .with_reconnect_interval(Duration::from_millis(50))
            .with_heartbeat_interval(Duration::from_millis(75));
        assert_eq!(endpoint.name, "lights");
        assert_eq!(endpoint.connect_timeout, Duration::from_millis(200));
        assert_eq!(endpoint.read_buffer_size, 16);
        assert_eq!(endpoint.reconnect_interval, Duration::from_millis(50));
        assert_eq!(endpoint.heartbeat_interval, Duration::from_millis(75));
    }

    #[test]
    fn test_link_state_default_and_display() {
        assert_eq!(LinkState::default(), LinkState::Disconnected);
        assert_eq!(LinkState::Connecting.to_string(), "connecting");
        assert_eq!(LinkState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_link_error_messages() {
        assert_eq!(LinkError::NotConnected.to_string(), "not connected to peer");
        assert_eq!(
            LinkError::FrameTooLarge { length: 10_001 }.to_string(),
            "frame too large: 10001 bytes (max 10000)"
        );
    }
}
