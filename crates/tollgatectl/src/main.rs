//! tollgatectl - operator CLI for tollgated

use anyhow::{Context, Result};
use clap::Parser;
use tollgate_ipc::{IpcClient, IpcError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{Cli, CtlCommand};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    debug!(socket = %cli.socket.display(), "Connecting to tollgated");
    let mut client = IpcClient::connect(&cli.socket)
        .await
        .with_context(|| format!("Failed to connect to {:?}", cli.socket))?;

    if let CtlCommand::Watch = cli.command {
        let mut events = client.subscribe().await?;
        debug!("Subscribed to events");
        loop {
            match events.next().await {
                Ok(event) => output::print_event(&event, cli.format),
                Err(IpcError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    let command = cli.command.into_command()?;
    debug!(command = ?command, "Sending command");
    match client.call(command).await {
        Ok(payload) => {
            output::print_payload(&payload, cli.format);
            Ok(())
        }
        Err(IpcError::Rejected(info)) => {
            debug!(code = ?info.code, "Command rejected");
            output::print_error(&info, cli.format);
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}
