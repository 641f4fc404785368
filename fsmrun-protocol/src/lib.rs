//! # fsmrun-protocol
//!
//! Control protocol spoken between a running fsmrun instance and its controllers.
//!
//! This crate provides:
//! - A small XML element tree used for protocol messages and model documents
//! - Typed `command` (controller to runtime) and `event` (runtime to controller) messages
//! - Newline-delimited line framing
//! - Error codes carried in `error` events

pub mod codec;
pub mod error;
pub mod message;
pub mod xml;

pub use codec::{encode_line, LineDecoder};
pub use error::{ErrorCode, ProtocolError};
pub use message::{Command, Event, NamedValue, StatusReport, TimerReport, VariableReport};
pub use xml::Element;

/// Default port an fsmrun instance listens on.
pub const DEFAULT_PORT: u16 = 54323;

/// Maximum length of a single protocol line (1 MiB).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// First line of [`HELP_TEXT`]. Marks the `log` event that answers `help`
/// apart from logs broadcast by the machine.
pub const HELP_HEADING: &str = "Commands (one <command type=\"...\"> document per line):";

/// Usage text carried by the `log` event that answers `help`.
pub const HELP_TEXT: &str = "\
Commands (one <command type=\"...\"> document per line):
  set <name> <value>  write an input or variable
  call <name>         pulse an input, observable once through called(name)
  status              current state, inputs, outputs, variables and timers
  reqFSM              the running model document
  reset               restart the machine from its initial state
  disconnect          close this connection
  shutdown            stop the runtime
  pong                answer a ping
  help                this text";
