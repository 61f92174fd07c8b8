//! # Link Framing
//!
//! Every byte on a [`Link`](crate::link::Link) travels inside a frame:
//!
//! ```text
//! +-----------+-------------+------------------+
//! | port (BE) | length (BE) | body (length B)  |
//! +-----------+-------------+------------------+
//!   2 bytes     2 bytes
//! ```
//!
//! Frames only split the stream; a port's bodies are reassembled by a
//! [`FrameReader`] when a protocol needs a byte stream, or treated as whole
//! [`Message`](crate::message::Message)s by a [`Network`](crate::network::Network).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Frame header length in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest body a frame can carry.
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Upper bound on a length-prefixed message read through a [`FrameReader`].
pub const MAX_CHANNEL_MESSAGE: usize = 1024 * 1024;

// ============================================================================
// Wire Errors
// ============================================================================

/// Decoding and encoding failures of the frame and message formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before a field could be read.
    BufferTooSmall { needed: usize, available: usize },
    /// The length field disagrees with the bytes present.
    LengthMismatch { declared: usize, actual: usize },
    /// Bytes after the body are not a whole number of trailers.
    TrailerMisaligned { remaining: usize },
    /// Body is larger than the length field can express.
    BodyTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::BufferTooSmall { needed, available } => {
                write!(f, "buffer too small: need {} bytes, have {}", needed, available)
            }
            WireError::LengthMismatch { declared, actual } => {
                write!(f, "length mismatch: declared {}, actual {}", declared, actual)
            }
            WireError::TrailerMisaligned { remaining } => {
                write!(f, "{} trailing bytes do not form whole trailers", remaining)
            }
            WireError::BodyTooLarge { len, max } => {
                write!(f, "body of {} bytes exceeds maximum {}", len, max)
            }
        }
    }
}

impl std::error::Error for WireError {}

// ============================================================================
// Frame
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub port: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(port: u16, body: Vec<u8>) -> Self {
        Self { port, body }
    }

    pub fn marshal(&self) -> Result<Vec<u8>, WireError> {
        let len = u16::try_from(self.body.len()).map_err(|_| WireError::BodyTooLarge {
            len: self.body.len(),
            max: MAX_FRAME_BODY,
        })?;
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decode exactly one frame occupying all of `buf`.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(WireError::BufferTooSmall {
                needed: FRAME_HEADER_LEN,
                available: buf.len(),
            });
        }
        let port = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let body = &buf[FRAME_HEADER_LEN..];
        if body.len() != len {
            return Err(WireError::LengthMismatch {
                declared: len,
                actual: body.len(),
            });
        }
        Ok(Self {
            port,
            body: body.to_vec(),
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .await
            .context("failed to read frame header")?;
        let port = u16::from_be_bytes([header[0], header[1]]);
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .context("failed to read frame body")?;
        Ok(Self { port, body })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.marshal()?;
        writer
            .write_all(&bytes)
            .await
            .context("failed to write frame")?;
        Ok(())
    }
}

// ============================================================================
// FrameWriter
// ============================================================================

/// Buffered writer emitting frames on one port of a Peer.
///
/// Clones share the closed flag and the link's outbound queue but each keeps
/// its own buffer, so concurrent senders should use [`FrameWriter::write_frame`].
#[derive(Clone)]
pub struct FrameWriter {
    port: u16,
    tx: mpsc::Sender<Frame>,
    buf: Vec<u8>,
    capacity: usize,
    closed: Arc<AtomicBool>,
}

impl FrameWriter {
    pub(crate) fn new(port: u16, tx: mpsc::Sender<Frame>, mtu: usize) -> Self {
        let capacity = mtu.saturating_sub(FRAME_HEADER_LEN).clamp(1, MAX_FRAME_BODY);
        Self {
            port,
            tx,
            buf: Vec::with_capacity(capacity),
            capacity,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Largest body one frame from this writer can carry.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Buffer `data`, emitting a frame each time the buffer fills.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<usize> {
        self.check_open()?;
        let total = data.len();
        while !data.is_empty() {
            let room = self.capacity - self.buf.len();
            let n = room.min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buf.len() == self.capacity {
                self.flush().await?;
            }
        }
        Ok(total)
    }

    /// Emit whatever is buffered as one frame.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.check_open()?;
        let body = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
        self.send(body).await
    }

    /// Send `body` as exactly one frame.
    pub async fn write_frame(&self, body: &[u8]) -> Result<()> {
        self.check_open()?;
        if body.len() > self.capacity {
            return Err(WireError::BodyTooLarge {
                len: body.len(),
                max: self.capacity,
            }
            .into());
        }
        self.send(body.to_vec()).await
    }

    /// Write a u32-BE length-prefixed message and flush it.
    pub async fn write_message(&mut self, message: &[u8]) -> Result<()> {
        let len = u32::try_from(message.len()).map_err(|_| anyhow!("message too large"))?;
        self.write(&len.to_be_bytes()).await?;
        self.write(message).await?;
        self.flush().await
    }

    /// Mark this writer (and every clone) closed. Buffered bytes are dropped.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.buf.clear();
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("frame writer for port {} is closed", self.port));
        }
        Ok(())
    }

    async fn send(&self, body: Vec<u8>) -> Result<()> {
        self.tx
            .send(Frame::new(self.port, body))
            .await
            .map_err(|_| anyhow!("link writer closed"))
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("port", &self.port)
            .field("capacity", &self.capacity)
            .field("buffered", &self.buf.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// FrameReader
// ============================================================================

/// Byte stream over the frame bodies delivered to one port.
pub struct FrameReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: VecDeque<u8>,
}

impl FrameReader {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            buf: VecDeque::new(),
        }
    }

    /// Read up to `out.len()` bytes; returns 0 once the port is closed and drained.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() && !self.fill().await {
            return Ok(0);
        }
        let n = out.len().min(self.buf.len());
        for (slot, byte) in out.iter_mut().zip(self.buf.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buf.len() < n {
            if !self.fill().await {
                return Err(anyhow!(
                    "channel closed after {} of {} bytes",
                    self.buf.len(),
                    n
                ));
            }
        }
        Ok(self.buf.drain(..n).collect())
    }

    /// Read one u32-BE length-prefixed message of at most `max_len` bytes.
    ///
    /// Cancel safe: nothing is consumed until the whole message is buffered.
    pub async fn read_message(&mut self, max_len: usize) -> Result<Vec<u8>> {
        while self.buf.len() < 4 {
            if !self.fill().await {
                return Err(anyhow!("channel closed"));
            }
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > max_len {
            return Err(anyhow!("message of {} bytes exceeds limit {}", len, max_len));
        }
        while self.buf.len() < 4 + len {
            if !self.fill().await {
                return Err(anyhow!("channel closed mid-message"));
            }
        }
        self.buf.drain(..4);
        Ok(self.buf.drain(..len).collect())
    }

    async fn fill(&mut self) -> bool {
        match self.rx.recv().await {
            Some(body) => {
                self.buf.extend(body);
                true
            }
            None => false,
        }
    }
}
