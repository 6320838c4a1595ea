use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
};

use crate::{
    error::{RelayError, Result},
    frame::{FrameReader, FrameWriter, MAX_FRAME_LEN, decode_text, read_frame, write_frame},
};

/// Any bidirectional byte stream a [`FramedConnection`] can own.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Exclusive owner of one transport handle, moving whole frames across it.
///
/// The connection is valid until [`close`](Self::close) is called or an I/O
/// error occurs. An invalid connection rejects sends and reports every receive
/// as "peer closed".
pub struct FramedConnection<S = TcpStream> {
    stream: Option<S>,
    max_frame_len: u32,
}

impl<S> FramedConnection<S>
where
    S: Transport,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    pub fn is_valid(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Sends one frame. An empty payload is written as a zero-length frame;
    /// the receiving side will read it as a disconnect.
    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(RelayError::not_connected());
        };
        let result = write_frame(stream, payload).await;
        if matches!(result, Err(RelayError::Transport(_))) {
            self.stream = None;
        }
        result
    }

    pub async fn receive(&mut self) -> Result<Option<String>> {
        match self.receive_bytes().await? {
            Some(payload) => decode_text(payload).map(Some),
            None => Ok(None),
        }
    }

    /// Blocks until a whole frame arrives. `Ok(None)` means the peer closed.
    pub async fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        // A failed read leaves the stream mid-frame, so it cannot be reused.
        let result = read_frame(stream, self.max_frame_len).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    /// Shuts the stream down and releases it. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    /// Splits a valid connection into independently owned halves so one task
    /// can block on receive while another sends. Returns `None` once the
    /// connection has been closed.
    pub fn into_split(self) -> Option<(FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)> {
        let stream = self.stream?;
        let (reader, writer) = tokio::io::split(stream);
        Some((
            FrameReader::new(reader, self.max_frame_len),
            FrameWriter::new(writer),
        ))
    }
}

impl FramedConnection<TcpStream> {
    /// The remote IP as text, used to name peers that connect anonymously.
    /// `None` once the connection is closed.
    pub fn peer_label(&self) -> Option<String> {
        let stream = self.stream.as_ref()?;
        stream.peer_addr().ok().map(|addr| addr.ip().to_string())
    }
}
