//! # ws-engine
//!
//! Command-line front end for the WebSocket engine.
//!
//! - `serve`: run a server that relays every text message to the other
//!   peers connected on the same path
//! - `send`: connect as a client, send one message and print what comes back

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::Level;
use ws_engine::config::{BasicValidator, ConfigLoader, EngineConfig, OriginValidator};
use ws_engine::websocket::{CloseCode, Engine, Event};

/// WebSocket engine
#[derive(Parser)]
#[command(name = "ws-engine")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "ws-engine.toml")]
    config: PathBuf,

    /// Override the configured address
    #[arg(long, global = true)]
    address: Option<String>,

    /// Override the configured port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a relay server
    Serve,

    /// Send one message as a client
    Send(SendArgs),
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Message text
    message: String,

    /// Resource path
    #[arg(long, default_value = "/")]
    path: String,

    /// Origin header to send
    #[arg(long)]
    origin: Option<String>,

    /// How long to wait for replies
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    wait: Duration,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let loader = ConfigLoader::new()
        .with_validator(BasicValidator::new())
        .with_validator(OriginValidator::new());
    let mut config = loader
        .load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Some(address) = &cli.address {
        config.address.clone_from(address);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    loader.validate(&config)?;
    Ok(config)
}

fn serve(config: EngineConfig) -> Result<()> {
    let mut engine = Engine::server(config)?;

    engine.on("connect", |hub, event| {
        if let Event::Connect { peer } = event {
            let others = hub.connections_by_path(&peer.path).len().saturating_sub(1);
            hub.send(peer.id, &format!("welcome, {others} other peer(s) here"))?;
        }
        Ok(())
    })?;

    engine.on("receive", |hub, event| {
        if let Event::Receive { peer, payload } = event {
            for other in hub.connections_by_path(&peer.path) {
                if other.id != peer.id {
                    // A peer that vanished mid-relay is reported through `error`.
                    let _ = hub.send(other.id, payload);
                }
            }
        }
        Ok(())
    })?;

    engine.on("error", |_, event| {
        if let Event::Error { info, .. } = event {
            tracing::error!(op = info.op, error = %info.message, "Transport error");
        }
        Ok(())
    })?;

    let addr = engine.bind()?;
    println!("ws-engine v{} listening on {addr}", env!("CARGO_PKG_VERSION"));
    engine.run()?;
    Ok(())
}

fn send(config: EngineConfig, args: SendArgs) -> Result<()> {
    let mut engine = Engine::client(config)?;

    engine.on("receive", |_, event| {
        if let Event::Receive { payload, .. } = event {
            println!("< {payload}");
        }
        Ok(())
    })?;
    engine.on("disconnect", |_, event| {
        if let Event::Disconnect { code, reason, .. } = event {
            println!("closed: {code} {reason}");
        }
        Ok(())
    })?;

    let id = engine
        .connect(&args.path, args.origin.as_deref())
        .context("handshake failed")?;
    engine.send(id, &args.message)?;
    println!("> {}", args.message);

    let deadline = Instant::now() + args.wait;
    while Instant::now() < deadline && engine.connection(id).is_some() {
        engine.poll_once(Duration::from_millis(50))?;
    }

    engine.disconnect(id, CloseCode::Normal, "");
    engine.stop();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if cli.verbose || config.enable_logging {
        setup_logging(cli.verbose);
    }

    match cli.command {
        Commands::Serve => serve(config),
        Commands::Send(args) => send(config, args),
    }
}
