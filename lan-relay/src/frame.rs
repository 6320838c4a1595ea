//! Length-prefixed framing shared by chat text, control tokens and update payloads.
//!
//! Wire format, one frame per logical message:
//!
//! ```text
//! [4 bytes: big-endian u32 length N] [N bytes: payload]
//! ```
//!
//! A zero-length frame is indistinguishable from a disconnect on the receive
//! side: both surface as `Ok(None)`. Senders never emit empty chat lines, so
//! the relay protocol never needs to tell the two apart.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};

/// Well-known TCP port used by both server and client when none is given.
pub const DEFAULT_PORT: u16 = 54000;

/// Upper bound on a declared frame length. Larger prefixes are rejected before
/// any payload byte is read.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Writes one frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| RelayError::FrameTooLarge {
        len: payload.len() as u64,
        max: u32::MAX,
    })?;

    // write_all loops over partial writes and reports WriteZero on a closed peer.
    writer.write_all(&len.to_be_bytes()).await?;
    if len > 0 {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream, either before
/// a prefix arrived, in the middle of a payload, or by sending a zero-length
/// frame.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    if !read_fully(reader, &mut prefix).await? {
        return Ok(None);
    }

    let len = u32::from_be_bytes(prefix);
    if len == 0 {
        return Ok(None);
    }
    if len > max_len {
        return Err(RelayError::FrameTooLarge {
            len: u64::from(len),
            max: max_len,
        });
    }

    let mut payload = vec![0u8; len as usize];
    if !read_fully(reader, &mut payload).await? {
        return Ok(None);
    }
    Ok(Some(payload))
}

async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

pub(crate) fn decode_text(payload: Vec<u8>) -> Result<String> {
    String::from_utf8(payload)
        .map_err(|err| RelayError::Transport(io::Error::new(io::ErrorKind::InvalidData, err)))
}

/// Receiving half of a split [`FramedConnection`](crate::connection::FramedConnection).
pub struct FrameReader<R> {
    inner: R,
    max_frame_len: u32,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_frame_len: u32) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    pub async fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.inner, self.max_frame_len).await
    }

    pub async fn receive(&mut self) -> Result<Option<String>> {
        match self.receive_bytes().await? {
            Some(payload) => decode_text(payload).map(Some),
            None => Ok(None),
        }
    }
}

/// Sending half of a split [`FramedConnection`](crate::connection::FramedConnection).
///
/// Once a write fails or [`close`](Self::close) is called the writer stays
/// closed and rejects further sends.
pub struct FrameWriter<W> {
    inner: Option<W>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }

    /// A writer with nothing behind it, for connections that were already
    /// closed when they were handed over.
    pub fn closed() -> Self {
        Self { inner: None }
    }

    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        let Some(writer) = self.inner.as_mut() else {
            return Err(RelayError::not_connected());
        };
        let result = write_frame(writer, payload).await;
        if matches!(result, Err(RelayError::Transport(_))) {
            self.inner = None;
        }
        result
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Shuts the write direction down. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Drops the underlying writer without a shutdown, for when a write has
    /// to be cut off mid-frame.
    pub fn abandon(&mut self) {
        self.inner = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// The raw writer, or `None` once closed.
    pub fn into_inner(self) -> Option<W> {
        self.inner
    }
}
