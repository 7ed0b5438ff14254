//! Station command handling
//!
//! This module handles:
//! - Validating station commands against the configured bounds
//! - Translating them into controller commands
//! - Producing the ack for every command id
//! - Tracking motion for the inactivity auto-stop

mod executor;
pub mod handlers;

pub use executor::{CommandExecutor, CommandResult, Dispatch};
