use tokio::net::{TcpStream, lookup_host};
use tracing::{debug, info};

use crate::{
    connection::FramedConnection,
    error::{RelayError, Result},
};

/// Resolves `host` and connects to the first candidate address that accepts.
pub async fn connect(host: &str, port: u16) -> Result<FramedConnection> {
    let target = format!("{host}:{port}");
    let candidates: Vec<_> = lookup_host((host, port))
        .await
        .map_err(|err| RelayError::Connect {
            target: target.clone(),
            reason: format!("could not resolve host: {err}"),
        })?
        .collect();

    let mut last_failure = String::from("host resolved to no addresses");
    for addr in candidates {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%addr, error = %err, "could not disable Nagle");
                }
                info!(%addr, "connected to relay");
                return Ok(FramedConnection::new(stream));
            }
            Err(err) => {
                debug!(%addr, error = %err, "candidate refused connection");
                last_failure = format!("{addr}: {err}");
            }
        }
    }

    Err(RelayError::Connect {
        target,
        reason: last_failure,
    })
}
