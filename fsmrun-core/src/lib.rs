//! # fsmrun-core
//!
//! Automaton engine for fsmrun.
//!
//! This crate provides:
//! - Model parsing and validation
//! - The entry-action and guard expression language
//! - Runtime session state (inputs, outputs, variables, armed timers)
//! - Transition selection and delayed-transition timers

pub mod definition;
pub mod engine;
pub mod error;
pub mod expr;
pub mod instance;
pub mod value;

pub use definition::{Delay, MachineDefinition, State, Transition, Variable};
pub use engine::{Engine, RuntimeEvent};
pub use error::CoreError;
pub use expr::{Context, Expr, Program};
pub use instance::{ArmedTimer, Instance, StatusSnapshot, TimerSnapshot, VariableSnapshot};
pub use value::{atoi_safe, Value, VarType};
