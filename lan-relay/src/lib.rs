//! Group chat relay for a local network.
//!
//! One machine runs the server; every other machine connects as a client.
//! Each line a client types is relayed to every other client as
//! `"[name]: text"`. Each module handles one concrete responsibility:
//!
//! - [`frame`] and [`connection`] move length-prefixed frames over any async
//!   byte stream.
//! - [`worker`] runs one receive task per peer and reports what it sees as
//!   [`worker::PeerEvent`]s.
//! - [`registry`] owns the connected peers and relays messages between them.
//! - [`listener`] and [`connector`] open the TCP sockets for each side.
//! - [`handshake`] exchanges versions and display names before a peer joins,
//!   and hands out updates to older clients.
//! - [`server`], [`client`], [`console`] and [`cli`] glue the pieces into
//!   the `lan-relay` binary.
//! - [`message`] timestamps lines for the client's session history.
//!
//! Integration tests drive the registry over loopback TCP and the binary
//! end to end.

pub mod cli;
pub mod client;
pub mod connection;
pub mod connector;
pub mod console;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod message;
pub mod registry;
pub mod server;
pub mod worker;

pub use connection::FramedConnection;
pub use error::{RelayError, Result};
pub use registry::{PeerRegistry, RoomEvent};
pub use worker::{ConnectionWorker, PeerEvent, PeerId};
