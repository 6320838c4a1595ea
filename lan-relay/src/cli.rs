use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    frame::DEFAULT_PORT,
    handshake::current_version,
    listener::ListenerConfig,
    server::ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the room: accept peers on the LAN and relay their messages.
    Server(ServerArgs),
    /// Join a room hosted by another machine.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Local address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// TCP port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Build offered to clients running an older version.
    #[arg(long)]
    pub update_file: Option<PathBuf>,
}

impl ServerArgs {
    /// Reads the update file, if any, and assembles the server settings.
    pub async fn server_config(&self) -> Result<ServerConfig> {
        let update = match &self.update_file {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read update file {}", path.display()))?,
            ),
            None => None,
        };

        Ok(ServerConfig {
            listener: ListenerConfig {
                bind_addr: self.bind,
                port: self.port,
                ..ListenerConfig::default()
            },
            version: current_version(),
            update,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Hostname or IP address of the machine hosting the room.
    #[arg(long)]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Display name; the server shows your IP address when omitted.
    #[arg(long, default_value = "")]
    pub name: String,

    /// Where a build offered by the server is saved.
    #[arg(long, default_value = "lan-relay.update")]
    pub update_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_listen_everywhere_on_the_default_port() {
        let cli = Cli::try_parse_from(["lan-relay", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(args.port, 54000);
        assert!(args.update_file.is_none());
    }

    #[test]
    fn client_requires_a_host() {
        assert!(Cli::try_parse_from(["lan-relay", "client"]).is_err());

        let cli = Cli::try_parse_from(["lan-relay", "client", "--host", "10.0.0.5", "--name", "alice"])
            .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.host, "10.0.0.5");
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.name, "alice");
    }

    #[tokio::test]
    async fn missing_update_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = ServerArgs {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            update_file: Some(dir.path().join("absent.bin")),
        };

        let err = args.server_config().await.expect_err("file does not exist");
        assert!(err.to_string().contains("absent.bin"));
    }

    #[tokio::test]
    async fn update_file_is_loaded_into_the_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("build.bin");
        std::fs::write(&path, b"payload").expect("write update");
        let args = ServerArgs {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            update_file: Some(path),
        };

        let config = args.server_config().await.expect("config");
        assert_eq!(config.update.as_deref(), Some(&b"payload"[..]));
        assert_eq!(config.listener.port, 0);
        assert_eq!(config.listener.backlog, 10);
    }
}
