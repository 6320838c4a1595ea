use std::{
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use semver::Version;
use tokio::{select, sync::watch, task::JoinSet, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    connection::FramedConnection,
    error::{RelayError, Result},
    frame::MAX_FRAME_LEN,
    handshake::{current_version, server_handshake},
    listener::{Listener, ListenerConfig},
    registry::PeerRegistry,
};

/// How long a freshly accepted peer has to complete the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest the shutdown goodbye may wait on peers that stopped reading.
pub const GOODBYE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub version: Version,
    /// Build offered to clients that report an older version.
    pub update: Option<Vec<u8>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            version: current_version(),
            update: None,
        }
    }
}

pub struct RelayServer {
    listener: Listener,
    registry: PeerRegistry,
    version: Arc<Version>,
    update: Option<Arc<[u8]>>,
}

impl RelayServer {
    /// Binds the listening socket and creates an empty room.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        if let Some(update) = &config.update {
            if update.len() as u64 > u64::from(MAX_FRAME_LEN) {
                return Err(RelayError::FrameTooLarge {
                    len: update.len() as u64,
                    max: MAX_FRAME_LEN,
                });
            }
        }

        let listener = Listener::bind(&config.listener)?;
        Ok(Self {
            listener,
            registry: PeerRegistry::new(),
            version: Arc::new(config.version),
            update: config.update.map(Arc::from),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Handle to the room, for console commands and observers.
    pub fn registry(&self) -> PeerRegistry {
        self.registry.clone()
    }

    /// Sends `"[Server]: text"` to every connected peer.
    pub async fn announce(&self, text: &str) -> usize {
        self.registry.broadcast_all("Server", text).await
    }

    /// Serves peers until `shutdown` resolves, then says goodbye and
    /// disconnects everyone.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let admissions = Arc::new(Mutex::new(JoinSet::new()));

        let registry = self.registry.clone();
        let version = Arc::clone(&self.version);
        let update = self.update.clone();
        let pending = Arc::clone(&admissions);
        self.listener.start(move |connection, peer| {
            let admit = admit_peer(
                connection,
                peer,
                registry.clone(),
                Arc::clone(&version),
                update.clone(),
                stop_rx.clone(),
            );
            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
            while pending.try_join_next().is_some() {}
            pending.spawn(admit);
            async {}
        })?;

        shutdown.await;
        info!("relay shutting down");

        // No new peers from here on, so the goodbye reaches exactly the room
        // that is about to be closed.
        stop_tx.send_replace(true);
        self.listener.stop().await;
        let mut admissions = std::mem::take(
            &mut *admissions.lock().unwrap_or_else(PoisonError::into_inner),
        );
        while admissions.join_next().await.is_some() {}

        if timeout(GOODBYE_TIMEOUT, self.announce("server shutting down"))
            .await
            .is_err()
        {
            warn!(timeout = ?GOODBYE_TIMEOUT, "goodbye did not reach every peer");
        }
        self.registry.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn admit_peer(
    mut connection: FramedConnection,
    peer: SocketAddr,
    registry: PeerRegistry,
    version: Arc<Version>,
    update: Option<Arc<[u8]>>,
    mut stop: watch::Receiver<bool>,
) {
    let handshake = timeout(
        HANDSHAKE_TIMEOUT,
        server_handshake(&mut connection, &version, update.as_deref()),
    );
    let hello = select! {
        biased;
        _ = stop.changed() => {
            debug!(%peer, "shutdown interrupted handshake");
            return;
        }
        result = handshake => result,
    };

    let hello = match hello {
        Ok(Ok(hello)) => hello,
        Ok(Err(err)) => {
            warn!(%peer, error = %err, "handshake failed");
            connection.close().await;
            return;
        }
        Err(_) => {
            warn!(%peer, timeout = ?HANDSHAKE_TIMEOUT, "handshake timed out");
            connection.close().await;
            return;
        }
    };

    let name = match hello.name.trim() {
        "" => connection
            .peer_label()
            .unwrap_or_else(|| peer.ip().to_string()),
        name => name.to_string(),
    };
    debug!(%peer, %name, client_version = %hello.version, "handshake complete");
    registry.add(connection, name).await;
}
