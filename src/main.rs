//! fsmrun - Finite-state machine runtime
//!
//! Loads an automaton model and runs it headless, controlled over a
//! line-oriented XML protocol on TCP.

use clap::Parser;
use fsmrun_core::{Engine, MachineDefinition};
use fsmrun_server::{Config, Server, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsmrun")]
#[command(about = "Runs an automaton model and serves the fsmrun control protocol")]
#[command(version)]
struct Args {
    /// Model document to run (overrides model.path from config)
    model: Option<PathBuf>,

    /// Host to bind
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to bind
    #[arg(short, long)]
    port: Option<u16>,

    /// YAML config file (overrides FSMRUN_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Defaults, then file, then environment, then flags
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("FSMRUN_CONFIG").ok().map(PathBuf::from));
    let mut config = match Config::load_from(config_path.as_deref()) {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Some(model) = args.model {
        config.model.path = Some(model);
    }
    let bind = config.network.bind_addr;
    config.network.bind_addr = SocketAddr::new(
        args.host.unwrap_or(bind.ip()),
        args.port.unwrap_or(bind.port()),
    );

    let Some(model_path) = config.model.path.clone() else {
        tracing::error!("No model given (pass MODEL or set model.path / FSMRUN_MODEL)");
        return Err("no model document specified".into());
    };

    let definition = match MachineDefinition::from_file(&model_path) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("Failed to load model {}: {}", model_path.display(), e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting fsmrun");
    tracing::info!("  Model: {} ({})", definition.name, model_path.display());
    tracing::info!(
        "  States: {}, transitions: {}",
        definition.states.len(),
        definition.transitions.len()
    );
    tracing::info!("  Bind address: {}", config.network.bind_addr);

    let server = Arc::new(Server::new(
        ServerConfig::from(&config.network),
        Engine::new(definition),
    ));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    if let Err(e) = server.run().await {
        tracing::error!("Server failed: {}", e);
        return Err(e.into());
    }

    tracing::info!("Server stopped");
    Ok(())
}
