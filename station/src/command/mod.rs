//! Command dispatch and ack tracking for the station
//!
//! This module handles:
//! - Numbering operator commands and sending them to the bridge
//! - Matching acks to pending commands
//! - Reporting commands that were never acknowledged

mod dispatcher;
mod timeout;

pub use dispatcher::CommandDispatcher;
pub use timeout::TimeoutTracker;
