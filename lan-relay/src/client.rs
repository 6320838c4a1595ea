use std::path::Path;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader},
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    connector,
    console::write_line,
    handshake::{HandshakeOutcome, client_handshake, current_version},
    message::{ChatHistory, ChatMessage},
    worker::{ConnectionWorker, EVENT_BACKLOG, PeerEvent},
};

/// How a chat session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    EndOfInput,
    ServerClosed,
    Interrupted,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    write_line(
        &mut stdout,
        &format!("[Client] Connecting to {}:{}...", args.host, args.port),
    )
    .await?;

    let mut connection = connector::connect(&args.host, args.port)
        .await
        .context("could not reach the relay")?;
    let outcome = client_handshake(&mut connection, &args.name, &current_version())
        .await
        .context("handshake with the relay failed")?;
    if let HandshakeOutcome::Update(build) = outcome {
        save_update(&args.update_path, &build).await?;
        write_line(
            &mut stdout,
            &format!(
                "[Client] The server offered a newer build; saved {} bytes to {}",
                build.len(),
                args.update_path.display()
            ),
        )
        .await?;
    }

    write_line(
        &mut stdout,
        "[Client] Connected! You are in the group chat. Type 'quit' to leave.",
    )
    .await?;

    let (events_tx, events) = mpsc::channel(EVENT_BACKLOG);
    let worker = ConnectionWorker::spawn(0, args.host.clone(), connection, events_tx);
    let history = ChatHistory::new();
    let stdin = BufReader::new(tokio::io::stdin());

    let ended = select! {
        ended = run_session(&worker, events, stdin, &mut stdout, &history) => ended,
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            Ok(SessionEnd::Interrupted)
        }
    };

    worker.stop();
    worker.join().await;
    info!(?ended, "chat session over");

    write_line(
        &mut stdout,
        &format!("[Chat] Disconnected. Messages exchanged: {}", history.len()),
    )
    .await?;
    ended.map(|_| ())
}

/// Relays input lines to the server and prints what it sends back until the
/// user leaves or the server goes away. Every line either way is recorded in
/// `history`.
pub async fn run_session<R, W>(
    worker: &ConnectionWorker,
    mut events: mpsc::Receiver<PeerEvent>,
    input: R,
    out: &mut W,
    history: &ChatHistory,
) -> Result<SessionEnd>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        select! {
            event = events.recv() => match event {
                Some(PeerEvent::Message { text, .. }) => {
                    // Relayed text already carries its "[sender]: " label.
                    write_line(out, &text).await?;
                    history.push(ChatMessage::new("", text));
                }
                Some(PeerEvent::Disconnected { .. }) | None => {
                    write_line(out, "[Chat] Server disconnected.").await?;
                    return Ok(SessionEnd::ServerClosed);
                }
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read input")? else {
                    return Ok(SessionEnd::EndOfInput);
                };
                let line = line.trim_end_matches('\r');
                match line {
                    "" => continue,
                    "quit" | "exit" => return Ok(SessionEnd::Quit),
                    _ => {}
                }
                worker.send(line).await;
                history.push(ChatMessage::new("You", line));
            }
        }
    }
}

pub async fn save_update(path: &Path, build: &[u8]) -> io::Result<()> {
    tokio::fs::write(path, build).await?;
    info!(path = %path.display(), bytes = build.len(), "saved update from server");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::DuplexStream, time::timeout};

    use super::*;
    use crate::connection::FramedConnection;

    const WAIT: Duration = Duration::from_secs(1);

    fn connected() -> (
        ConnectionWorker,
        mpsc::Receiver<PeerEvent>,
        FramedConnection<DuplexStream>,
    ) {
        let (local, remote) = tokio::io::duplex(4096);
        let (events_tx, events) = mpsc::channel(EVENT_BACKLOG);
        let worker = ConnectionWorker::spawn(0, "relay", FramedConnection::new(local), events_tx);
        (worker, events, FramedConnection::new(remote))
    }

    #[tokio::test]
    async fn typed_lines_are_sent_until_quit() {
        let (worker, events, mut server) = connected();
        let history = ChatHistory::new();
        let mut out = Vec::new();

        let ended = run_session(&worker, events, &b"hello\n\nquit\nnever sent\n"[..], &mut out, &history)
            .await
            .expect("session");

        assert_eq!(ended, SessionEnd::Quit);
        assert_eq!(history.len(), 1);
        let received = timeout(WAIT, server.receive())
            .await
            .expect("frame in time")
            .expect("receive");
        assert_eq!(received.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn relayed_lines_are_printed_until_the_server_leaves() {
        let (worker, events, mut server) = connected();
        let history = ChatHistory::new();
        let mut out = Vec::new();
        // Held open so input never reaches end of stream.
        let (_typing, input) = tokio::io::duplex(64);

        server.send("[bob]: hi").await.expect("send");
        server.close().await;

        let ended = timeout(
            WAIT,
            run_session(&worker, events, BufReader::new(input), &mut out, &history),
        )
        .await
        .expect("session ends in time")
        .expect("session");

        assert_eq!(ended, SessionEnd::ServerClosed);
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "[bob]: hi\n[Chat] Server disconnected.\n"
        );
        assert_eq!(history.len(), 1);
        assert!(history.lines()[0].ends_with("] [bob]: hi"));
    }

    #[tokio::test]
    async fn offered_update_is_written_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lan-relay.update");

        save_update(&path, b"fresh build").await.expect("save");

        assert_eq!(std::fs::read(&path).expect("read back"), b"fresh build");
    }
}
