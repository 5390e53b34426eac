//! Call framing over a byte stream.
//!
//! Every frame is a length-prefixed JSON document:
//!
//! ```text
//! <length>\r\n<length bytes of JSON>
//!
//! Example:
//! 45\r\n{"type":"call","method":"Echo","metadata":[]}
//! ```
//!
//! A call is a `call` frame, zero or more `message` frames and a
//! `half_close` (or `cancel`) from the client; the server answers with zero
//! or more `message` frames and exactly one `trailers` frame.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::metadata::Metadata;
use crate::status::Status;

/// Maximum frame body size
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Longest accepted length line, digits only
const MAX_HEADER_LEN: usize = 20;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start a call.
    Call {
        method: String,
        #[serde(default)]
        metadata: Metadata,
    },
    /// One request message.
    Message { body: serde_json::Value },
    /// No more request messages.
    HalfClose,
    /// Abandon the call.
    Cancel,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// One response message.
    Message { body: serde_json::Value },
    /// Final frame of a call.
    Trailers {
        status: Status,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        trailers: Metadata,
    },
}

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame length: {0}")]
    InvalidLength(String),
    #[error("frame of {0} bytes exceeds the 16MB limit")]
    TooLarge(usize),
    #[error("invalid frame body: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult<T> {
    /// A complete frame and the bytes it occupied.
    Complete(T, usize),
    /// Need more data.
    Incomplete,
}

/// Parse one frame from the start of `input`.
pub fn parse<T>(input: &[u8]) -> Result<ParseResult<T>, FrameError>
where
    T: for<'de> Deserialize<'de>,
{
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_LEN => {
            return Err(FrameError::InvalidLength(
                String::from_utf8_lossy(&input[..MAX_HEADER_LEN]).into_owned(),
            ))
        }
        None => return Ok(ParseResult::Incomplete),
    };

    let line = &input[..line_end];
    let length: usize = std::str::from_utf8(line)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::InvalidLength(String::from_utf8_lossy(line).into_owned()))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let header_len = line_end + 2; // length line + \r\n
    let total = header_len + length;
    if input.len() < total {
        return Ok(ParseResult::Incomplete);
    }

    let frame = serde_json::from_slice(&input[header_len..total])?;
    Ok(ParseResult::Complete(frame, total))
}

/// Encode a frame: length header followed by the JSON body.
pub fn encode<T: Serialize>(frame: &T) -> Result<BytesMut, FrameError> {
    let body = serde_json::to_vec(frame)?;
    let mut output = BytesMut::with_capacity(body.len() + MAX_HEADER_LEN + 2);
    output.extend_from_slice(format!("{}\r\n", body.len()).as_bytes());
    output.extend_from_slice(&body);
    Ok(output)
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Buffered frame reader.
///
/// [`next_frame`](Self::next_frame) is cancel-safe: partial frames stay in
/// the buffer between calls.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Read the next frame; `None` on a clean end of stream.
    pub async fn next_frame<T>(&mut self) -> Result<Option<T>, FrameError>
    where
        T: for<'de> Deserialize<'de>,
    {
        loop {
            if let ParseResult::Complete(frame, consumed) = parse(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(Some(frame));
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::UnexpectedEof);
            }
        }
    }
}

/// Frame writer.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    pub async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), FrameError> {
        let data = encode(frame)?;
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
