use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info};

use crate::{
    connection::{FramedConnection, Transport},
    worker::{ConnectionWorker, EVENT_BACKLOG, PeerEvent, PeerId},
};

/// Room activity for observers such as the server console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Joined {
        id: PeerId,
        name: String,
        active: usize,
    },
    Message {
        id: PeerId,
        name: String,
        text: String,
    },
    Left {
        id: PeerId,
        name: String,
        active: usize,
    },
}

/// Formats a relayed line the way every peer sees it.
pub fn format_line(sender: &str, text: &str) -> String {
    format!("[{sender}]: {text}")
}

/// Thread-safe set of connected peers and the broadcast logic over them.
///
/// Cloning yields another handle to the same registry. Workers report back
/// through an event channel drained by a dispatcher task: messages are relayed
/// to every other peer, disconnects remove the peer.
#[derive(Clone)]
pub struct PeerRegistry {
    state: Arc<RegistryState>,
}

struct RegistryState {
    peers: Mutex<Peers>,
    events: mpsc::Sender<PeerEvent>,
    notices: broadcast::Sender<RoomEvent>,
}

struct Peers {
    workers: BTreeMap<PeerId, Arc<ConnectionWorker>>,
    next_id: PeerId,
}

impl PeerRegistry {
    /// Creates an empty registry and starts its dispatcher task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (events, events_rx) = mpsc::channel(EVENT_BACKLOG);
        // Observers that fall this far behind start seeing `Lagged`.
        let (notices, _) = broadcast::channel(256);

        let state = Arc::new(RegistryState {
            peers: Mutex::new(Peers {
                workers: BTreeMap::new(),
                next_id: 1,
            }),
            events,
            notices,
        });

        tokio::spawn(dispatch_events(Arc::downgrade(&state), events_rx));

        Self { state }
    }

    /// Registers a connection and returns its freshly assigned id.
    pub async fn add<S>(&self, connection: FramedConnection<S>, name: impl Into<String>) -> PeerId
    where
        S: Transport,
    {
        let name = name.into();
        let (id, active) = {
            let mut peers = self.state.peers.lock().await;
            let id = peers.next_id;
            peers.next_id += 1;

            let worker =
                ConnectionWorker::spawn(id, name.clone(), connection, self.state.events.clone());
            peers.workers.insert(id, Arc::new(worker));
            (id, peers.workers.len())
        };

        info!(peer = id, %name, active, "peer joined");
        self.state.notify(RoomEvent::Joined { id, name, active });
        id
    }

    /// Stops and forgets a peer. Returns `false` when the id is unknown,
    /// which makes duplicate disconnect signals harmless.
    pub async fn remove(&self, id: PeerId) -> bool {
        self.state.remove(id).await
    }

    /// Sends `"[sender_name]: text"` to every active peer except `sender_id`.
    /// Returns the number of peers the line was handed to.
    pub async fn broadcast(&self, sender_id: PeerId, sender_name: &str, text: &str) -> usize {
        self.state
            .fan_out(&format_line(sender_name, text), Some(sender_id))
            .await
    }

    /// Sends `"[label]: text"` to every active peer.
    pub async fn broadcast_all(&self, label: &str, text: &str) -> usize {
        self.state.fan_out(&format_line(label, text), None).await
    }

    pub async fn count(&self) -> usize {
        self.state.peers.lock().await.workers.len()
    }

    /// Ids and display names of the registered peers, in id order.
    pub async fn names(&self) -> Vec<(PeerId, String)> {
        let peers = self.state.peers.lock().await;
        peers
            .workers
            .values()
            .map(|worker| (worker.id(), worker.name().to_string()))
            .collect()
    }

    /// Stops every worker and empties the registry without waiting for the
    /// receive tasks to finish.
    pub async fn stop_all(&self) {
        let mut peers = self.state.peers.lock().await;
        for worker in peers.workers.values() {
            worker.stop();
        }
        peers.workers.clear();
    }

    /// Like [`stop_all`](Self::stop_all), then waits until every receive task
    /// has exited.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = {
            let mut peers = self.state.peers.lock().await;
            std::mem::take(&mut peers.workers).into_values().collect()
        };
        for worker in &workers {
            worker.stop();
        }
        for worker in &workers {
            worker.join().await;
        }
        info!(stopped = workers.len(), "registry shut down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.state.notices.subscribe()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    fn notify(&self, event: RoomEvent) {
        // No subscribers is the normal case outside the server console.
        let _ = self.notices.send(event);
    }

    async fn remove(&self, id: PeerId) -> bool {
        let (worker, active) = {
            let mut peers = self.peers.lock().await;
            let worker = peers.workers.remove(&id);
            if let Some(worker) = &worker {
                worker.stop();
            }
            (worker, peers.workers.len())
        };

        let Some(worker) = worker else {
            return false;
        };

        let name = worker.name().to_string();
        info!(peer = id, %name, active, "peer disconnected");
        self.notify(RoomEvent::Left { id, name, active });
        true
    }

    /// Snapshot the recipients under the lock, then send with the lock
    /// released so a slow peer cannot stall registration or other relays.
    async fn fan_out(&self, payload: &str, exclude: Option<PeerId>) -> usize {
        let recipients: Vec<Arc<ConnectionWorker>> = {
            let peers = self.peers.lock().await;
            peers
                .workers
                .values()
                .filter(|worker| Some(worker.id()) != exclude && worker.is_active())
                .cloned()
                .collect()
        };

        for worker in &recipients {
            worker.send(payload).await;
        }
        recipients.len()
    }
}

async fn dispatch_events(state: Weak<RegistryState>, mut events: mpsc::Receiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };

        match event {
            PeerEvent::Message { id, name, text } => {
                debug!(peer = id, %name, bytes = text.len(), "relaying message");
                state.notify(RoomEvent::Message {
                    id,
                    name: name.clone(),
                    text: text.clone(),
                });
                state.fan_out(&format_line(&name, &text), Some(id)).await;
            }
            PeerEvent::Disconnected { id } => {
                state.remove(id).await;
            }
        }
    }
    debug!("registry dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::DuplexStream, time::timeout};

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    async fn join(registry: &PeerRegistry, name: &str) -> (PeerId, FramedConnection<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let id = registry.add(FramedConnection::new(local), name).await;
        (id, FramedConnection::new(remote))
    }

    async fn expect_line(conn: &mut FramedConnection<DuplexStream>) -> String {
        timeout(WAIT, conn.receive())
            .await
            .expect("line in time")
            .expect("receive")
            .expect("connection open")
    }

    async fn expect_silence(conn: &mut FramedConnection<DuplexStream>) {
        let result = timeout(Duration::from_millis(100), conn.receive()).await;
        assert!(result.is_err(), "expected no traffic, got {result:?}");
    }

    async fn wait_for_count(registry: &PeerRegistry, expected: usize) {
        timeout(WAIT, async {
            while registry.count().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry count never settled");
    }

    #[test]
    fn lines_carry_sender_label() {
        assert_eq!(format_line("alice", "hi"), "[alice]: hi");
        assert_eq!(format_line("Server", ""), "[Server]: ");
    }

    #[tokio::test]
    async fn ids_start_at_one_and_are_never_reused() {
        let registry = PeerRegistry::new();

        let (a, _a_conn) = join(&registry, "a").await;
        let (b, _b_conn) = join(&registry, "b").await;
        assert_eq!((a, b), (1, 2));

        assert!(registry.remove(b).await);
        let (c, _c_conn) = join(&registry, "c").await;
        assert_eq!(c, 3);
        assert_eq!(registry.count().await, 2);
        assert_eq!(
            registry.names().await,
            vec![(1, "a".to_string()), (3, "c".to_string())]
        );
    }

    #[tokio::test]
    async fn removing_unknown_id_is_a_no_op() {
        let registry = PeerRegistry::new();
        let (id, _conn) = join(&registry, "a").await;

        assert!(registry.remove(id).await);
        assert!(!registry.remove(id).await);
        assert!(!registry.remove(42).await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let registry = PeerRegistry::new();
        let (a, mut a_conn) = join(&registry, "a").await;
        let (_b, mut b_conn) = join(&registry, "b").await;
        let (_c, mut c_conn) = join(&registry, "c").await;

        let delivered = registry.broadcast(a, "a", "hi").await;

        assert_eq!(delivered, 2);
        assert_eq!(expect_line(&mut b_conn).await, "[a]: hi");
        assert_eq!(expect_line(&mut c_conn).await, "[a]: hi");
        expect_silence(&mut a_conn).await;
    }

    #[tokio::test]
    async fn broadcast_all_reaches_everyone() {
        let registry = PeerRegistry::new();
        let (_a, mut a_conn) = join(&registry, "a").await;
        let (_b, mut b_conn) = join(&registry, "b").await;

        let delivered = registry.broadcast_all("Server", "welcome").await;

        assert_eq!(delivered, 2);
        assert_eq!(expect_line(&mut a_conn).await, "[Server]: welcome");
        assert_eq!(expect_line(&mut b_conn).await, "[Server]: welcome");
    }

    #[tokio::test]
    async fn peer_messages_are_relayed_to_others() {
        let registry = PeerRegistry::new();
        let (_a, mut a_conn) = join(&registry, "A").await;
        let (_b, mut b_conn) = join(&registry, "B").await;

        a_conn.send("hi").await.expect("send");

        assert_eq!(expect_line(&mut b_conn).await, "[A]: hi");
        expect_silence(&mut a_conn).await;
    }

    #[tokio::test]
    async fn remote_disconnect_removes_the_peer() {
        let registry = PeerRegistry::new();
        let (_a, mut a_conn) = join(&registry, "a").await;
        let (_b, _b_conn) = join(&registry, "b").await;

        a_conn.close().await;

        wait_for_count(&registry, 1).await;
        assert_eq!(registry.names().await, vec![(2, "b".to_string())]);
    }

    #[tokio::test]
    async fn concurrent_adds_get_distinct_ids() {
        let registry = PeerRegistry::new();
        let mut tasks = Vec::new();
        for n in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (local, remote) = tokio::io::duplex(1024);
                let id = registry.add(FramedConnection::new(local), format!("peer-{n}")).await;
                (id, remote)
            }));
        }

        let mut ids = Vec::new();
        let mut remotes = Vec::new();
        for task in tasks {
            let (id, remote) = task.await.expect("join add");
            ids.push(id);
            remotes.push(remote);
        }
        ids.sort_unstable();

        assert_eq!(ids, (1..=32).collect::<Vec<PeerId>>());
        assert_eq!(registry.count().await, 32);
    }

    #[tokio::test]
    async fn shutdown_stops_every_worker() {
        let registry = PeerRegistry::new();
        let (_a, mut a_conn) = join(&registry, "a").await;
        let (_b, mut b_conn) = join(&registry, "b").await;

        registry.shutdown().await;

        assert_eq!(registry.count().await, 0);
        assert_eq!(a_conn.receive().await.expect("receive"), None);
        assert_eq!(b_conn.receive().await.expect("receive"), None);
    }

    #[tokio::test]
    async fn stop_all_clears_the_registry() {
        let registry = PeerRegistry::new();
        let (_a, mut a_conn) = join(&registry, "a").await;

        registry.stop_all().await;

        assert_eq!(registry.count().await, 0);
        assert_eq!(registry.broadcast_all("Server", "anyone?").await, 0);
        let closed = timeout(WAIT, a_conn.receive()).await.expect("closed in time");
        assert_eq!(closed.expect("receive"), None);
    }

    #[tokio::test]
    async fn observers_see_room_activity() {
        let registry = PeerRegistry::new();
        let mut notices = registry.subscribe();

        let (a, mut a_conn) = join(&registry, "a").await;
        a_conn.send("hello room").await.expect("send");
        a_conn.close().await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(timeout(WAIT, notices.recv()).await.expect("notice").expect("open"));
        }
        assert_eq!(
            seen,
            vec![
                RoomEvent::Joined {
                    id: a,
                    name: "a".into(),
                    active: 1
                },
                RoomEvent::Message {
                    id: a,
                    name: "a".into(),
                    text: "hello room".into()
                },
                RoomEvent::Left {
                    id: a,
                    name: "a".into(),
                    active: 0
                },
            ]
        );
    }

    #[tokio::test]
    async fn oversized_frame_drops_only_that_peer() {
        use tokio::io::AsyncWriteExt;

        let registry = PeerRegistry::new();
        let (_a, mut a_conn) = join(&registry, "a").await;
        let (_b, mut b_conn) = join(&registry, "b").await;
        let (local, mut raw) = tokio::io::duplex(1024);
        registry.add(FramedConnection::new(local), "huge").await;
        assert_eq!(registry.count().await, 3);

        let declared: u32 = 100 * 1024 * 1024;
        raw.write_all(&declared.to_be_bytes()).await.expect("write prefix");

        wait_for_count(&registry, 2).await;
        assert_eq!(
            registry.names().await,
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
        a_conn.send("still here").await.expect("send");
        assert_eq!(expect_line(&mut b_conn).await, "[a]: still here");
    }

    #[tokio::test]
    async fn shutdown_is_not_held_up_by_a_stalled_peer() {
        let registry = PeerRegistry::new();
        // Nobody ever reads this end, so writes to the peer park once 64 bytes are queued.
        let (local, _stalled) = tokio::io::duplex(64);
        registry.add(FramedConnection::new(local), "stalled").await;

        let announcer = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.broadcast_all("Server", &"z".repeat(4096)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!announcer.is_finished());

        timeout(Duration::from_secs(3), registry.shutdown())
            .await
            .expect("shutdown finished");
        let delivered = timeout(WAIT, announcer)
            .await
            .expect("announcement cut off")
            .expect("join announcer");
        assert_eq!(delivered, 1);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn stalled_recipient_holds_back_the_sender() {
        let registry = PeerRegistry::new();
        let (_a, mut a_conn) = join(&registry, "a").await;
        let (local, _stalled) = tokio::io::duplex(64);
        registry.add(FramedConnection::new(local), "stalled").await;

        let flood = tokio::spawn(async move {
            let line = "f".repeat(1024);
            let mut sent = 0usize;
            for _ in 0..20_000 {
                if a_conn.send(&line).await.is_err() {
                    break;
                }
                sent += 1;
            }
            sent
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            !flood.is_finished(),
            "the relay must stop reading from a sender whose recipients cannot keep up"
        );

        timeout(Duration::from_secs(3), registry.shutdown())
            .await
            .expect("shutdown finished");
        let sent = timeout(Duration::from_secs(3), flood)
            .await
            .expect("sender released")
            .expect("join sender");
        assert!(sent < 20_000);
    }
}
