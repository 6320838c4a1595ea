//! Terminal side of server mode: room activity goes out as plain lines and
//! operator input comes back in as announcements.

use std::net::IpAddr;

use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::broadcast::{self, error::RecvError},
};
use tracing::warn;

use crate::registry::{PeerRegistry, RoomEvent, format_line};

/// Why the operator loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorExit {
    /// `quit` or `exit` was typed.
    Quit,
    EndOfInput,
}

pub fn describe(event: &RoomEvent) -> String {
    match event {
        RoomEvent::Joined { name, active, .. } => {
            format!("[Room] {name} joined. Active clients: {active}")
        }
        RoomEvent::Message { name, text, .. } => format_line(name, text),
        RoomEvent::Left { name, active, .. } => {
            format!("[Room] {name} disconnected. Active clients: {active}")
        }
    }
}

/// Prints every room event until the registry goes away.
pub async fn print_room_events<W>(mut events: broadcast::Receiver<RoomEvent>, mut out: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => write_line(&mut out, &describe(&event)).await?,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "console fell behind room activity");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

/// Broadcasts each non-empty input line to every peer as `Server`.
pub async fn relay_operator_input<R, W>(
    registry: &PeerRegistry,
    input: R,
    out: &mut W,
) -> io::Result<OperatorExit>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        match line {
            "" => continue,
            "quit" | "exit" => return Ok(OperatorExit::Quit),
            _ => {}
        }

        if registry.broadcast_all("Server", line).await == 0 {
            write_line(out, "[Server] No clients connected yet.").await?;
        }
    }
    Ok(OperatorExit::EndOfInput)
}

/// IPv4 addresses the host name resolves to, in resolver order.
pub async fn lan_addresses() -> Vec<IpAddr> {
    let Some(host) = host_name() else {
        return Vec::new();
    };
    let addrs = match tokio::net::lookup_host((host.as_str(), 0)).await {
        Ok(resolved) => {
            let mut addrs = Vec::new();
            for ip in resolved.map(|addr| addr.ip()).filter(IpAddr::is_ipv4) {
                if !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
            addrs
        }
        Err(err) => {
            warn!(%host, error = %err, "could not resolve own host name");
            Vec::new()
        }
    };
    addrs
}

#[cfg(unix)]
fn host_name() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(name) => name.into_string().ok(),
        Err(err) => {
            warn!(error = %err, "could not read host name");
            None
        }
    }
}

#[cfg(not(unix))]
fn host_name() -> Option<String> {
    None
}

/// The startup notice telling the operator which addresses clients can dial.
pub fn address_lines(addrs: &[IpAddr]) -> Vec<String> {
    let mut lines = vec!["[Server] Your LAN IP address(es):".to_string()];
    lines.extend(addrs.iter().map(|ip| format!("           {ip}")));
    lines
}

pub fn shutdown_line(connected: usize) -> String {
    format!("[Server] Shutting down. Clients connected: {connected}")
}

/// Writes `line` plus a newline and flushes.
pub async fn write_line<W>(out: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
