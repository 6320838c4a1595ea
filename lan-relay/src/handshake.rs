//! Session setup exchanged before a peer joins the room.
//!
//! ```text
//! client                         server
//!   CMD:VERSION:<semver>   ->
//!   <name> | CMD:ANONYMOUS ->
//!                          <-    CMD:OK
//!                          <-    CMD:UPDATE:<n>, then one frame of n bytes
//! ```
//!
//! Every step is an ordinary frame, so the update payload is bounded by the
//! same frame limit as chat traffic.

use std::{fmt, str::FromStr};

use semver::Version;
use tracing::{debug, info};

use crate::{
    connection::{FramedConnection, Transport},
    error::{RelayError, Result},
};

const PREFIX: &str = "CMD:";

/// The version this build announces during the handshake.
pub fn current_version() -> Version {
    Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlToken {
    Ok,
    Version(Version),
    Update(u64),
    /// Sent in place of the name when the client has none.
    Anonymous,
}

impl ControlToken {
    /// `None` when `text` is not a control token at all.
    pub fn parse(text: &str) -> Option<Result<Self>> {
        let body = text.strip_prefix(PREFIX)?;
        let (command, arg) = match body.split_once(':') {
            Some((command, arg)) => (command, Some(arg)),
            None => (body, None),
        };

        let token = match (command, arg) {
            ("OK", None) => Ok(ControlToken::Ok),
            ("ANONYMOUS", None) => Ok(ControlToken::Anonymous),
            ("VERSION", Some(arg)) => Version::parse(arg)
                .map(ControlToken::Version)
                .map_err(|err| RelayError::Handshake(format!("bad version {arg:?}: {err}"))),
            ("UPDATE", Some(arg)) => arg
                .parse()
                .map(ControlToken::Update)
                .map_err(|err| RelayError::Handshake(format!("bad update size {arg:?}: {err}"))),
            _ => Err(RelayError::Handshake(format!("unknown control token {text:?}"))),
        };
        Some(token)
    }
}

impl FromStr for ControlToken {
    type Err = RelayError;

    fn from_str(text: &str) -> Result<Self> {
        ControlToken::parse(text)
            .unwrap_or_else(|| Err(RelayError::Handshake(format!("expected a control token, got {text:?}"))))
    }
}

impl fmt::Display for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlToken::Ok => write!(f, "{PREFIX}OK"),
            ControlToken::Version(version) => write!(f, "{PREFIX}VERSION:{version}"),
            ControlToken::Update(len) => write!(f, "{PREFIX}UPDATE:{len}"),
            ControlToken::Anonymous => write!(f, "{PREFIX}ANONYMOUS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    UpToDate,
    /// The server offered a newer build; the bytes are exactly what it sent.
    Update(Vec<u8>),
}

/// What the server learned about a newly connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Empty when the client connected anonymously.
    pub name: String,
    pub version: Version,
}

pub async fn client_handshake<S>(
    conn: &mut FramedConnection<S>,
    name: &str,
    version: &Version,
) -> Result<HandshakeOutcome>
where
    S: Transport,
{
    conn.send(&ControlToken::Version(version.clone()).to_string())
        .await?;
    let name = name.trim();
    if name.is_empty() {
        conn.send(&ControlToken::Anonymous.to_string()).await?;
    } else {
        conn.send(name).await?;
    }

    let reply = expect_frame(conn, "reply").await?;
    match reply.parse::<ControlToken>()? {
        ControlToken::Ok => Ok(HandshakeOutcome::UpToDate),
        ControlToken::Update(len) => {
            if len > u64::from(conn.max_frame_len()) {
                return Err(RelayError::FrameTooLarge {
                    len,
                    max: conn.max_frame_len(),
                });
            }
            let payload = conn.receive_bytes().await?.ok_or_else(|| {
                RelayError::Handshake("server closed before sending the update".into())
            })?;
            if payload.len() as u64 != len {
                return Err(RelayError::Handshake(format!(
                    "update announced {len} bytes but {} arrived",
                    payload.len()
                )));
            }
            info!(bytes = len, "server offered an update");
            Ok(HandshakeOutcome::Update(payload))
        }
        other => Err(RelayError::Handshake(format!("unexpected reply {other}"))),
    }
}

/// Reads the client's greeting and answers it. An update is sent only when
/// one is configured and the client reports an older version.
pub async fn server_handshake<S>(
    conn: &mut FramedConnection<S>,
    server_version: &Version,
    update: Option<&[u8]>,
) -> Result<ClientHello>
where
    S: Transport,
{
    let greeting = expect_frame(conn, "version").await?;
    let ControlToken::Version(version) = greeting.parse::<ControlToken>()? else {
        return Err(RelayError::Handshake(format!(
            "expected a version token, got {greeting:?}"
        )));
    };

    let name = expect_frame(conn, "name").await?;
    let name = match ControlToken::parse(&name) {
        None => name,
        Some(Ok(ControlToken::Anonymous)) => String::new(),
        Some(_) => {
            return Err(RelayError::Handshake(format!(
                "expected a display name, got {name:?}"
            )));
        }
    };

    match update {
        Some(payload) if version < *server_version => {
            debug!(client = %version, server = %server_version, bytes = payload.len(), "sending update");
            conn.send(&ControlToken::Update(payload.len() as u64).to_string())
                .await?;
            conn.send_bytes(payload).await?;
        }
        _ => conn.send(&ControlToken::Ok.to_string()).await?,
    }

    Ok(ClientHello { name, version })
}

async fn expect_frame<S>(conn: &mut FramedConnection<S>, what: &str) -> Result<String>
where
    S: Transport,
{
    conn.receive()
        .await?
        .ok_or_else(|| RelayError::Handshake(format!("peer closed while waiting for {what}")))
}
