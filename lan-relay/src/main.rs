use anyhow::{Context, Result};
use clap::Parser;
use tokio::{io::BufReader, select};
use tracing::{info, warn};

use lan_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    console::{self, OperatorExit},
    server::RelayServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout belongs to the chat console.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = args.server_config().await?;
    let server = RelayServer::bind(config).context("failed to start the relay")?;
    let addr = server.local_addr();
    info!(%addr, "relay listening");

    let registry = server.registry();
    tokio::spawn(async move {
        if let Err(err) = console::print_room_events(registry.subscribe(), tokio::io::stdout()).await {
            warn!(error = ?err, "console output failed");
        }
    });

    let mut stdout = tokio::io::stdout();
    for line in console::address_lines(&console::lan_addresses().await) {
        console::write_line(&mut stdout, &line).await?;
    }
    console::write_line(
        &mut stdout,
        &format!("[Server] Listening on {addr}. Type messages to broadcast, 'quit' to shut down."),
    )
    .await?;

    let room = server.registry();
    let registry = server.registry();
    let operator = async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match console::relay_operator_input(&registry, stdin, &mut stdout).await {
            Ok(OperatorExit::Quit) => {}
            Ok(OperatorExit::EndOfInput) => {
                info!("console input closed; serving until ctrl-c");
                std::future::pending::<()>().await;
            }
            Err(err) => {
                warn!(error = ?err, "console input failed; serving until ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    server
        .run_until(async {
            select! {
                _ = operator => {}
                ctrl_c = tokio::signal::ctrl_c() => {
                    if let Err(err) = ctrl_c {
                        warn!(error = ?err, "failed to install ctrl-c handler");
                    }
                }
            }
            let notice = console::shutdown_line(room.count().await);
            if let Err(err) = console::write_line(&mut tokio::io::stdout(), &notice).await {
                warn!(error = ?err, "console output failed");
            }
        })
        .await?;

    Ok(())
}
