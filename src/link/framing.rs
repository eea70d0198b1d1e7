//! Wire protocol codec for the board link.
//!
//! Length-prefixed JSON frames:
//!
//! ```text
//! [u32 BE length] [payload: length bytes of UTF-8 JSON object]
//! ```
//!
//! `0 < length <= MAX_FRAME_BYTES`. A header outside that range is reported
//! as [`FrameError::Framing`] and only its four bytes are consumed; the
//! reader keeps going with whatever follows. There is no scan for the next
//! plausible header, so a peer that desynchronizes the stream stays
//! desynchronized until the connection is replaced.

use std::collections::VecDeque;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_BYTES, PING_TYPE, PONG_TYPE, TYPE_FIELD};

/// A decoded frame payload: a JSON object.
pub type Message = serde_json::Map<String, serde_json::Value>;

/// Errors produced while reading frames off the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length prefix is zero or exceeds [`MAX_FRAME_BYTES`].
    #[error("invalid frame length: {length} (max {MAX_FRAME_BYTES})")]
    Framing {
        /// Length claimed by the header.
        length: u32,
    },

    /// The payload is not a UTF-8 JSON object.
    #[error("malformed frame payload: {0}")]
    Parse(#[source] serde_json::Error),

    /// The peer closed the stream or the socket failed.
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] io::Error),
}

impl FrameError {
    /// Whether the connection survives this error.
    ///
    /// Malformed frames are dropped and reading continues; only a lost
    /// connection ends the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ConnectionLost(_))
    }
}

/// Encode a message into a wire-format byte vector.
///
/// Returns `[u32 BE length][payload]`. Size limits are enforced by the
/// sender, not here.
pub fn encode(message: &Message) -> Vec<u8> {
    let payload = serde_json::to_vec(message).expect("JSON object serialization cannot fail");
    let length = payload.len() as u32;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&payload);
    buf
}

/// Parse a length prefix.
///
/// # Errors
///
/// Returns [`FrameError::Framing`] for a zero length or one above
/// [`MAX_FRAME_BYTES`].
pub fn decode_header(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, FrameError> {
    let length = u32::from_be_bytes(header);
    if length == 0 || length as usize > MAX_FRAME_BYTES {
        return Err(FrameError::Framing { length });
    }
    Ok(length as usize)
}

/// Parse a frame payload.
///
/// # Errors
///
/// Returns [`FrameError::Parse`] if the bytes are not UTF-8 JSON or the
/// JSON is not an object.
pub fn decode_body(payload: &[u8]) -> Result<Message, FrameError> {
    serde_json::from_slice(payload).map_err(FrameError::Parse)
}

/// The `type` field of a message, if it has a string one.
pub fn message_type(message: &Message) -> Option<&str> {
    message.get(TYPE_FIELD).and_then(serde_json::Value::as_str)
}

/// Heartbeat probe: `{"type": "ping"}`.
pub fn ping() -> Message {
    typed(PING_TYPE)
}

/// Heartbeat reply: `{"type": "pong"}`.
pub fn pong() -> Message {
    typed(PONG_TYPE)
}

/// Whether a message is a heartbeat reply.
pub fn is_pong(message: &Message) -> bool {
    message_type(message) == Some(PONG_TYPE)
}

fn typed(kind: &str) -> Message {
    let mut message = Message::new();
    message.insert(TYPE_FIELD.to_string(), serde_json::Value::from(kind));
    message
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and collect one result per frame.
/// Handles TCP-style byte stream reassembly.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract every complete frame.
    ///
    /// Incomplete data is buffered for the next call. Malformed frames come
    /// back as `Err` entries in stream order alongside the good ones; they
    /// never poison the decoder.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Message, FrameError>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                break;
            }

            let header = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
            let length = match decode_header(header) {
                Ok(length) => length,
                Err(e) => {
                    // Drop the header only; the next four bytes are read as a new header.
                    self.buf.drain(..FRAME_HEADER_LEN);
                    frames.push(Err(e));
                    continue;
                }
            };

            let total = FRAME_HEADER_LEN + length;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            frames.push(decode_body(&self.buf[FRAME_HEADER_LEN..total]));
            self.buf.drain(..total);
        }

        frames
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Reads frames from an async byte stream.
///
/// Owns the read half of a connection; reads are never shared, so no
/// locking is involved. `next_message` is cancel safe: dropping its future
/// between polls loses no buffered bytes.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
    pending: VecDeque<Result<Message, FrameError>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `reader`, reading at most `buffer_size` bytes per call.
    pub fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; buffer_size.max(1)],
            pending: VecDeque::new(),
        }
    }

    /// Next decoded frame, or the error it produced.
    ///
    /// # Errors
    ///
    /// [`FrameError::Framing`] and [`FrameError::Parse`] describe one dropped
    /// frame; calling again continues with the next. An empty read or I/O
    /// error returns [`FrameError::ConnectionLost`].
    pub async fn next_message(&mut self) -> Result<Message, FrameError> {
        loop {
            if let Some(result) = self.pending.pop_front() {
                return result;
            }

            let n = self
                .reader
                .read(&mut self.buf)
                .await
                .map_err(FrameError::ConnectionLost)?;
            if n == 0 {
                return Err(FrameError::ConnectionLost(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )));
            }
            self.pending.extend(self.decoder.feed(&self.buf[..n]));
        }
    }
}
