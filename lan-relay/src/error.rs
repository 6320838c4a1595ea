use std::{io, net::SocketAddr};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u32 },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("listener already running")]
    AlreadyRunning,
}

impl RelayError {
    pub(crate) fn not_connected() -> Self {
        RelayError::Transport(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection is closed",
        ))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
