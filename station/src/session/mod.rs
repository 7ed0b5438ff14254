//! Session management for connected bridges
//!
//! This module handles:
//! - Tracking every connected bridge session
//! - Sending station messages to them
//! - Dropping sessions that fall silent

mod connection;
mod manager;

pub use connection::{BridgeSession, SessionHandle};
pub use manager::SessionManager;
