//! # fsmrun-server
//!
//! TCP control server for a running fsmrun machine.
//!
//! This crate provides:
//! - A TCP listener speaking the line-oriented XML control protocol
//! - A single runtime loop that owns the engine and schedules its timers
//! - Event broadcast to every connected controller
//! - Configuration loading (YAML file and environment)

pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, ModelConfig, NetworkConfig};
pub use error::ServerError;
pub use handler::{CommandHandler, Reply, SessionAction, HELP_TEXT};
pub use registry::{ClientHandle, ClientRegistry};
pub use server::{Server, ServerConfig};
pub use session::{ClientId, Session};
