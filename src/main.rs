//! Ganglion bridge CLI - exposes local terminal apps and shells to a
//! remote hub.
//!
//! This is the thin binary entry point. See the `ganglion_bridge` library
//! for the session engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ganglion_bridge::{constants, default_config, get_environment, load_config, GanglionClient};

/// Serve terminal apps and shells to a ganglion hub.
#[derive(Debug, Parser)]
#[command(name = "ganglion-bridge", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "ganglion.toml")]
    config: PathBuf,

    /// Hub environment to connect to (prod, dev, local).
    #[arg(short, long)]
    environment: Option<String>,

    /// API key presented during the channel handshake.
    #[arg(long)]
    api_key: Option<String>,

    /// Enable devtools in served apps.
    #[arg(long)]
    devtools: bool,

    /// Exit after this many seconds with no active sessions (0 disables).
    #[arg(long, default_value_t = 0)]
    exit_on_idle: u64,

    /// Serve an additional app; `NAME=COMMAND` or just a command.
    #[arg(short, long)]
    app: Vec<String>,

    /// Serve an additional terminal; `NAME=COMMAND` or just a command.
    #[arg(short, long)]
    terminal: Vec<String>,
}

/// Split `NAME=COMMAND` specs; a bare command doubles as its own name.
fn split_spec(spec: &str) -> (&str, &str) {
    match spec.split_once('=') {
        Some((name, command)) => (name, command),
        None => (spec, spec),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let environment_name = args
        .environment
        .unwrap_or_else(constants::environment);
    let environment = get_environment(&environment_name)?;

    let config = if args.config.exists() {
        load_config(&args.config)?
    } else {
        default_config()
    };
    let api_key = args.api_key.or_else(constants::api_key);

    let client = Arc::new(GanglionClient::new(
        &args.config,
        config,
        environment,
        api_key,
        args.devtools,
        Duration::from_secs(args.exit_on_idle),
    )?);

    for spec in &args.app {
        let (name, command) = split_spec(spec);
        client.add_app(name, command, "");
    }
    for spec in &args.terminal {
        let (name, command) = split_spec(spec);
        client.add_terminal(name, command, "");
    }
    if client.app_count() == 0 {
        log::warn!("No apps configured; serving an empty bridge");
    }

    let signal_client = Arc::clone(&client);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Exit requested");
            signal_client.force_exit();
        }
    });

    client.run().await
}
