use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use tokio::{
    net::{TcpListener, TcpSocket},
    select,
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::FramedConnection,
    error::{RelayError, Result},
    frame::DEFAULT_PORT,
};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: IpAddr,
    /// Use 0 for an ephemeral port.
    pub port: u16,
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            backlog: 10,
        }
    }
}

/// Bound TCP socket plus the background accept loop that hands every new
/// connection to a caller-supplied callback.
pub struct Listener {
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds and listens, failing fast when the port is unavailable.
    pub fn bind(config: &ListenerConfig) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|source| RelayError::Bind { addr, source })?;

        socket
            .set_reuseaddr(true)
            .map_err(|source| RelayError::Bind { addr, source })?;
        socket
            .bind(addr)
            .map_err(|source| RelayError::Bind { addr, source })?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|source| RelayError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Listen { addr, source })?;

        info!(%local_addr, "listening for peers");
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            listener: Some(listener),
            shutdown,
            accept_task: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Spawns the accept loop. `on_connection` runs inline in that loop for
    /// every accepted peer, so long-running work belongs in its own task.
    ///
    /// The loop ends on the first accept failure or on [`stop`](Self::stop);
    /// it is never restarted.
    pub fn start<F, Fut>(&mut self, on_connection: F) -> Result<()>
    where
        F: FnMut(FramedConnection, SocketAddr) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = self.listener.take().ok_or(RelayError::AlreadyRunning)?;
        let shutdown = self.shutdown.subscribe();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, shutdown, on_connection)));
        Ok(())
    }

    /// Closes the listening socket and waits for the accept loop to exit.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        // Dropping an unstarted listener closes its socket.
        self.listener = None;
        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await {
                warn!(error = ?err, "accept loop panicked");
            }
        }
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    mut on_connection: F,
) where
    F: FnMut(FramedConnection, SocketAddr) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let accepted = select! {
            biased;
            _ = shutdown.changed() => {
                debug!("accept loop stopped");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                on_connection(FramedConnection::new(stream), peer).await;
            }
            Err(err) => {
                warn!(error = %RelayError::Accept(err), "accept loop ending");
                break;
            }
        }
    }
}
