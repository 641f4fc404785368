//! fsmrun-cli - Command-line controller for a running fsmrun instance
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use fsmrun_client::{Client, ConnectionConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsmrun-cli")]
#[command(about = "Command-line controller for a running fsmrun state machine")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:54323", env = "FSMRUN_SERVER")]
    server: SocketAddr,

    /// Milliseconds to wait for the events caused by set, call and reset
    #[arg(long, default_value = "200")]
    wait_ms: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive REPL
    Repl,

    /// Write an input or variable
    Set {
        /// Input or variable name
        name: String,
        /// New value
        value: String,
    },

    /// Pulse an input
    Call {
        /// Input name
        name: String,
    },

    /// Show current state, inputs, outputs, variables and timers
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the server's usage text
    Help,

    /// Print the running model document
    Model,

    /// Restart the machine from its initial state
    Reset,

    /// Stop the runtime
    Shutdown,

    /// Print every event until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!("Using server {}", cli.server);
    let client = Client::new(ConnectionConfig::new(cli.server));

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, cli.server).await?;
        }
        Some(Commands::Watch) => {
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;
            let mut events = client.subscribe();

            eprintln!("{} {}", "Watching".green(), cli.server.to_string().cyan());
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(e) => println!("{}", commands::format_event(&e)),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                eprintln!("{}", "Connection closed".red());
                                break;
                            }
                        }
                    }
                    _ = wait_for_close(&client) => {
                        eprintln!("{}", "Connection closed".red());
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping watch...".dimmed());
                        break;
                    }
                }
            }

            client.close().await?;
        }
        Some(cmd) => {
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let wait = Duration::from_millis(cli.wait_ms);
            match commands::execute(&client, cmd, wait).await {
                Ok(output) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }

            client.close().await?;
        }
    }

    Ok(())
}

/// Resolves once the server has closed the connection.
async fn wait_for_close(client: &Client) {
    while client.is_connected() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
