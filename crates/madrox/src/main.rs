//! madrox: hierarchical orchestrator for terminal-attached AI assistants.
//!
//! A single binary with no subcommands. Transport selection: `--transport`
//! (or `MADROX_TRANSPORT`) forces a mode; otherwise a TTY on stdin means
//! HTTP and a pipe means stdio.
//!
//! Exit codes: 0 clean shutdown, 1 fatal bootstrap failure, 2 configuration
//! error.

use clap::Parser;
use madrox_core::{logging, Config, TransportMode};
use madrox_orchestrator::{InstanceManager, Supervisor};
use madrox_term::TmuxBackend;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "madrox", version, about = "Orchestrate teams of terminal-attached AI assistants over MCP")]
struct Cli {
    /// Force the transport ('http' or 'stdio') instead of auto-selecting.
    #[arg(long)]
    transport: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("madrox: configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(raw) = &cli.transport {
        match TransportMode::parse(raw) {
            Ok(mode) => config.transport = Some(mode),
            Err(e) => {
                eprintln!("madrox: configuration error: {e}");
                return ExitCode::from(2);
            }
        }
    }

    logging::init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let transport = config.transport.unwrap_or_else(|| {
        // A terminal on stdin means nobody is piping JSON-RPC at us.
        if std::io::stdin().is_terminal() {
            TransportMode::Http
        } else {
            TransportMode::Stdio
        }
    });
    info!("starting madrox ({transport} transport)");

    let port = config.port;
    let manager = Arc::new(InstanceManager::new(
        config,
        Arc::new(TmuxBackend::default()),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor = Supervisor::new(manager.clone());
    let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    let served = match transport {
        TransportMode::Stdio => madrox_mcp::stdio::serve(manager).await,
        TransportMode::Http => {
            tokio::select! {
                result = madrox_mcp::http::serve(manager, port) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    Ok(())
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    supervisor_task.abort();
    served.map_err(|e| anyhow::anyhow!("transport failed: {e}"))
}
