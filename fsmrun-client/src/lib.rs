//! # fsmrun-client
//!
//! Client library for fsmrun.
//!
//! This crate provides:
//! - Async TCP connection speaking the line-oriented XML control protocol
//! - Typed commands and a broadcast stream of typed events
//! - Automatic `pong` answers to server `ping`s

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
