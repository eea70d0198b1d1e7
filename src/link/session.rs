//! Per-session background loops.
//!
//! Both loops live exactly as long as one connected socket. They exit when
//! the session token is cancelled, or after reporting a transport failure
//! to the state machine, which then replaces the session.

use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio_util::sync::CancellationToken;

use super::framing::{self, FrameReader};
use super::peer::Inner;

/// Read frames and dispatch them until the socket fails or the session ends.
///
/// Malformed frames are logged and skipped. Heartbeat replies are consumed
/// here and never reach the handler.
pub(super) async fn receive_loop(
    inner: Arc<Inner>,
    generation: u64,
    read_half: OwnedReadHalf,
    cancel: CancellationToken,
) {
    let name = inner.endpoint().name.clone();
    let mut reader = FrameReader::new(read_half, inner.endpoint().read_buffer_size);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.next_message() => result,
        };

        match result {
            Ok(message) if framing::is_pong(&message) => {
                log::trace!("[{}] pong", name);
            }
            Ok(message) => inner.dispatch(message),
            Err(e) if e.is_recoverable() => {
                log::warn!("[{}] Dropping frame: {e}", name);
            }
            Err(e) => {
                log::warn!("[{}] Receive failed: {e}", name);
                inner.report_failure(generation);
                break;
            }
        }
    }

    log::debug!("[{}] Receive loop exiting (session {})", name, generation);
}

/// Send a ping now and then once per heartbeat interval.
///
/// A failed write has already been reported by the send path; the loop
/// just stops.
pub(super) async fn heartbeat_loop(inner: Arc<Inner>, generation: u64, cancel: CancellationToken) {
    let name = inner.endpoint().name.clone();
    let interval = inner.endpoint().heartbeat_interval;
    let ping = framing::encode(&framing::ping());

    loop {
        match inner.write_frame(Some(generation), &ping).await {
            Ok(()) => log::trace!("[{}] ping", name),
            Err(e) => {
                log::debug!("[{}] Heartbeat stopped: {e}", name);
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    log::debug!("[{}] Heartbeat loop exiting (session {})", name, generation);
}
