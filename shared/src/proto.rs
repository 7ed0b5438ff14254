//! Wire types
//!
//! Two message families travel over the same line codec:
//! - station <-> bridge messages, tagged by `"type"`
//! - bridge <-> microcontroller messages, tagged by `"cmd"` (outbound) and
//!   `"frame"` (inbound)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The two peers the bridge keeps a link with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peer {
    /// Microcontroller on the serial link
    Controller,
    /// Control station on the TCP link
    Station,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Controller => write!(f, "controller"),
            Peer::Station => write!(f, "station"),
        }
    }
}

/// Connection status of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Station <-> bridge
// ---------------------------------------------------------------------------

/// Liveness ping, also used as the body of `heartbeat_ack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub seq: u64,
    pub timestamp_ms: u64,
}

/// Motion actions understood by `robot_control`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveAction {
    Forward,
    Backward,
    Left,
    Right,
    SoftLeft,
    SoftRight,
    Stop,
    SetSpeed,
}

/// Motion command from the station
///
/// Numeric fields are signed and unbounded on the wire; range checks happen
/// in the bridge so an out-of-range value produces a rejection instead of a
/// parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotControl {
    pub id: u64,
    pub action: DriveAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Used by `set_speed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorAction {
    Calibrate,
    CalibrateAll,
}

/// Sensor calibration request from the station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorControl {
    pub id: u64,
    pub action: SensorAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<String>,
}

/// Messages sent by the control station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationMessage {
    Heartbeat(Heartbeat),
    HeartbeatAck(Heartbeat),
    RobotControl(RobotControl),
    SensorControl(SensorControl),
}

/// One annotated sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor: String,
    pub value: f64,
    pub alert: bool,
}

/// Telemetry frame forwarded to the station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub readings: Vec<Reading>,
}

impl Telemetry {
    /// True if any reading crossed its threshold
    pub fn has_alert(&self) -> bool {
        self.readings.iter().any(|r| r.alert)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Validated and queued for the controller
    Accepted,
    /// Failed validation, never forwarded
    Rejected,
    /// Valid, but could not be delivered
    Failed,
}

/// Answer to a station command, correlated by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub id: u64,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    WatchdogTimeout,
    AutoStop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp_ms: u64,
    pub kind: AlertKind,
    pub message: String,
}

/// Snapshot of both links, pushed on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub timestamp_ms: u64,
    pub station: LinkState,
    pub controller: LinkState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
}

/// Messages sent by the bridge to the control station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Heartbeat(Heartbeat),
    HeartbeatAck(Heartbeat),
    Telemetry(Telemetry),
    Ack(Ack),
    Alert(Alert),
    Status(LinkStatus),
    Error(ErrorReport),
}

// ---------------------------------------------------------------------------
// Bridge <-> microcontroller
// ---------------------------------------------------------------------------

/// Motion directions understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    SoftLeft,
    SoftRight,
}

/// Commands written to the serial link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControllerCommand {
    Drive {
        direction: Direction,
        speed: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
    },
    SetSpeed {
        speed: u16,
    },
    /// Zero speed on all motors
    Stop,
    Calibrate {
        sensor: String,
    },
    CalibrateAll,
    Ping {
        seq: u64,
    },
}

/// Frames read from the serial link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ControllerFrame {
    Sensors { readings: BTreeMap<String, f64> },
    Pong { seq: u64 },
    Status { message: String },
}
