#![allow(clippy::multiple_crate_versions)]

use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use eightfold_runtime::prelude::*;

mod mcp_server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let matches = Command::new("eightfold-server")
        .version(VERSION)
        .about("Eight-phase task orchestration server")
        .subcommand(Command::new("serve").about("Start the MCP server over stdio"))
        .subcommand(
            Command::new("check-config")
                .about("Validate configuration loaded from the environment and exit")
                .arg(
                    Arg::new("quiet")
                        .short('q')
                        .long("quiet")
                        .action(ArgAction::SetTrue)
                        .help("Suppress the printed config summary on success"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("check-config", sub)) => check_config(sub.get_flag("quiet")),
        _ => serve().await,
    }
}

fn check_config(quiet: bool) {
    match Config::from_env().and_then(|cfg| cfg.validate().map(|_| cfg)) {
        Ok(cfg) => {
            if !quiet {
                println!("configuration valid: {cfg:#?}");
            }
        }
        Err(e) => {
            eprintln!("configuration invalid: {e}");
            std::process::exit(1);
        }
    }
}

async fn serve() {
    // Direct tracing to stderr — stdout is the MCP transport channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = match Config::from_env().and_then(|cfg| cfg.validate().map(|_| cfg)) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration, exiting");
            std::process::exit(1);
        }
    };

    let backend = Arc::new(FileSessionBackend::new(config.session_store.store_path.clone()));
    let sessions = Arc::new(SessionStore::new(backend));
    let eviction_max_age = std::time::Duration::from_secs(config.session_store.eviction_hours * 3600);
    eightfold_runtime::session::spawn_eviction_sweep(Arc::clone(&sessions), eviction_max_age);
    let registry = EndpointRegistry::load(config.endpoint_registry_path.as_deref());
    let controller = Arc::new(PhaseController::new(config, Arc::clone(&sessions), registry));

    let result = mcp_server::start_mcp_server(controller).await;

    // stdio transport closed (client disconnected or process signaled to
    // stop) — give any pending write-behind persistence one last attempt
    // before exiting.
    sessions.drain().await;

    if let Err(e) = result {
        tracing::error!(error = %e, "mcp server exited with error");
        std::process::exit(1);
    }
}
