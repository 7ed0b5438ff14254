//! Firebot Shared Protocol Types
//!
//! This crate provides the wire types, line codec and link lifecycle shared
//! by the bridge, the control-station endpoint and the firmware protocol.

pub mod codec;
pub mod proto;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use proto::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Liveness parameters that are not exposed in the configuration file
pub mod liveness {
    /// Ceiling for the station reconnect backoff
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

    /// Base delay between serial open attempts (multiplied by the attempt count)
    pub const SERIAL_RETRY_DELAY_MS: u64 = 1000;

    /// Ceiling for the serial retry delay
    pub const SERIAL_MAX_RETRY_DELAY_MS: u64 = 5000;

    /// Time link tasks get to finish in-flight I/O once shutdown starts
    pub const SHUTDOWN_GRACE_MS: u64 = 2000;

    /// How often the bridge looks for motion inactivity
    pub const AUTO_STOP_CHECK_MS: u64 = 1000;

    /// Station-side timeout for a silent bridge session
    pub const SESSION_TIMEOUT_MS: u64 = 10_000;

    /// Station-side timeout waiting for a command ack
    pub const COMMAND_ACK_TIMEOUT_MS: u64 = 3000;
}

impl Heartbeat {
    /// Create a heartbeat stamped with the current wall-clock time
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            timestamp_ms: now_ms(),
        }
    }
}

impl Ack {
    pub fn accepted(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: AckStatus::Accepted,
            message: message.into(),
        }
    }

    pub fn rejected(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: AckStatus::Rejected,
            message: message.into(),
        }
    }

    pub fn failed(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: AckStatus::Failed,
            message: message.into(),
        }
    }
}

impl StationMessage {
    /// Id of a command message; heartbeats carry none
    pub fn command_id(&self) -> Option<u64> {
        match self {
            StationMessage::RobotControl(c) => Some(c.id),
            StationMessage::SensorControl(c) => Some(c.id),
            StationMessage::Heartbeat(_) | StationMessage::HeartbeatAck(_) => None,
        }
    }
}

impl BridgeMessage {
    /// Build a status message for the given link states
    pub fn status(station: LinkState, controller: LinkState) -> Self {
        BridgeMessage::Status(LinkStatus {
            timestamp_ms: now_ms(),
            station,
            controller,
        })
    }

    pub fn alert(kind: AlertKind, message: impl Into<String>) -> Self {
        BridgeMessage::Alert(Alert {
            timestamp_ms: now_ms(),
            kind,
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        BridgeMessage::Error(ErrorReport {
            message: message.into(),
        })
    }
}
