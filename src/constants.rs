//! Protocol and connection constants for board-link.
//!
//! Centralizes the wire limits and the default timings used when no
//! configuration file or environment override is present.
//!
//! # Categories
//!
//! - **Wire**: frame size limits and reserved message types
//! - **Timeouts**: connection establishment
//! - **Intervals**: reconnect and heartbeat pacing

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a frame may carry.
///
/// The board firmware parses payloads into a small fixed JSON document, so
/// anything beyond this is treated as corruption rather than data.
pub const MAX_FRAME_BYTES: usize = 10_000;

/// Field naming the kind of a protocol-internal message.
pub const TYPE_FIELD: &str = "type";

/// Heartbeat probe sent by the controller.
pub const PING_TYPE: &str = "ping";

/// Heartbeat reply sent by the board.
pub const PONG_TYPE: &str = "pong";

/// Top-level key wrapping a settings update.
pub const SET_FIELD: &str = "set";

// ============================================================================
// Timeouts
// ============================================================================

/// Upper bound on a single TCP connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Intervals
// ============================================================================

/// Fixed delay between failed connection attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between heartbeat pings on a live connection.
///
/// A dead board is noticed within roughly one interval, when the next ping
/// write fails.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Read buffer handed to the socket on every receive call.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

// ============================================================================
// Endpoint
// ============================================================================

/// Static address the board firmware configures for itself.
pub const DEFAULT_HOST: &str = "192.168.1.50";

/// Port the board firmware listens on.
pub const DEFAULT_PORT: u16 = 5000;

/// Label used in log lines when no name is configured.
pub const DEFAULT_NAME: &str = "board";
