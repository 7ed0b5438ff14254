//! Control-station link
//!
//! This module handles:
//! - The outbound TCP connection to the station with automatic reconnection
//! - Heartbeat ping / heartbeat_ack exchange
//! - Line framing of station messages in both directions

mod manager;

pub use manager::{ConnectionEvent, ConnectionManager, LinkControl};
