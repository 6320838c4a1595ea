//! One task per peer: blocking receives feed typed events to whoever owns the
//! worker, while sends from any number of tasks are serialized on a lock.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    connection::{FramedConnection, Transport},
    frame::{FrameReader, FrameWriter},
};

pub type PeerId = u64;

/// Suggested capacity for the channel handed to [`ConnectionWorker::spawn`].
/// A full channel stalls only the receive task that is trying to publish.
pub const EVENT_BACKLOG: usize = 64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Events emitted by a worker's receive task.
///
/// `Disconnected` is sent exactly once per worker, after the last `Message`,
/// whether the loop ended because of `stop`, end of stream, or an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Message {
        id: PeerId,
        name: String,
        text: String,
    },
    Disconnected {
        id: PeerId,
    },
}

pub struct ConnectionWorker {
    id: PeerId,
    name: String,
    writer: Arc<Mutex<FrameWriter<BoxedWriter>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionWorker {
    /// Takes ownership of `connection` and starts its receive task immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(
        id: PeerId,
        name: impl Into<String>,
        connection: FramedConnection<S>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Self
    where
        S: Transport,
    {
        let name = name.into();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        let (reader, writer) = match connection.into_split() {
            Some((reader, writer)) => {
                let writer = match writer.into_inner() {
                    Some(raw) => FrameWriter::new(Box::new(raw) as BoxedWriter),
                    None => FrameWriter::closed(),
                };
                (Some(reader), writer)
            }
            None => (None, FrameWriter::closed()),
        };

        let writer = Arc::new(Mutex::new(writer));
        let running = Arc::new(AtomicBool::new(reader.is_some()));

        let task = tokio::spawn(receive_loop(ReceiveContext {
            id,
            name: name.clone(),
            reader,
            writer: Arc::clone(&writer),
            running: Arc::clone(&running),
            stop_tx: Arc::clone(&shutdown),
            stop_rx: shutdown_rx,
            events,
        }));

        Self {
            id,
            name,
            writer,
            running,
            shutdown,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until `stop` is called or the receive loop ends.
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sends one frame to this peer. Concurrent callers are serialized.
    ///
    /// Failures are logged and swallowed: a dead peer is reported through
    /// the receive loop's `Disconnected` event, never through `send`. A send
    /// parked on a peer that stopped reading is cut off by `stop`, which
    /// also drops the write half.
    pub async fn send(&self, text: &str) {
        let stop = self.shutdown.subscribe();
        let mut writer = select! {
            biased;
            _ = stopped(stop.clone()) => return,
            writer = self.writer.lock() => writer,
        };
        if writer.is_closed() {
            return;
        }

        let sent = select! {
            biased;
            _ = stopped(stop) => None,
            result = writer.send(text) => Some(result),
        };
        match sent {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                debug!(peer = self.id, name = %self.name, error = %err, "send to peer failed");
            }
            None => {
                debug!(peer = self.id, name = %self.name, "send cut off by stop");
                writer.abandon();
            }
        }
    }

    /// Marks the worker stopped, wakes its receive task and interrupts any
    /// send in progress. Does not wait for the task; use
    /// [`join`](Self::join) for that.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    /// Waits for the receive task to finish. Later calls return immediately.
    pub async fn join(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(peer = self.id, error = ?err, "receive task panicked");
            }
        }
    }
}

impl Drop for ConnectionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        let is_stopped = *stop.borrow_and_update();
        if is_stopped || stop.changed().await.is_err() {
            return;
        }
    }
}

struct ReceiveContext<R> {
    id: PeerId,
    name: String,
    reader: Option<FrameReader<R>>,
    writer: Arc<Mutex<FrameWriter<BoxedWriter>>>,
    running: Arc<AtomicBool>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    events: mpsc::Sender<PeerEvent>,
}

async fn receive_loop<R>(ctx: ReceiveContext<R>)
where
    R: AsyncRead + Unpin,
{
    let ReceiveContext {
        id,
        name,
        reader,
        writer,
        running,
        stop_tx,
        stop_rx,
        events,
    } = ctx;

    if let Some(mut reader) = reader {
        loop {
            let received = select! {
                biased;
                _ = stopped(stop_rx.clone()) => {
                    debug!(peer = id, "receive loop stopped locally");
                    break;
                }
                received = reader.receive() => received,
            };

            match received {
                Ok(Some(text)) => {
                    let event = PeerEvent::Message {
                        id,
                        name: name.clone(),
                        text,
                    };
                    // A full channel holds back this peer only.
                    let published = select! {
                        biased;
                        _ = stopped(stop_rx.clone()) => false,
                        sent = events.send(event) => sent.is_ok(),
                    };
                    if !published {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = id, %name, "peer closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(peer = id, %name, error = %err, "dropping peer after receive error");
                    break;
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    // Cuts off any send parked on this peer so the writer lock comes free.
    stop_tx.send_replace(true);
    writer.lock().await.close().await;
    let _ = events.send(PeerEvent::Disconnected { id }).await;
}
