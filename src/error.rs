//! Bridge error taxonomy

use crate::config::ConfigError;
use firebot_shared::Peer;
use thiserror::Error;

/// Errors that end or degrade a bridge run
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Fatal at startup
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serial device absent, I/O failure or bad frame past the retry budget
    #[error("serial link error: {reason}")]
    SerialLink { reason: String },

    /// Station link failure with reconnection disabled
    #[error("network link error: {reason}")]
    NetworkLink { reason: String },

    #[error("{peer} silent for {silent_ms} ms (window {window_ms} ms)")]
    WatchdogTimeout {
        peer: Peer,
        silent_ms: u64,
        window_ms: u64,
    },
}

/// A station command outside the configured bounds
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("speed {speed} outside [0, {max}]")]
    SpeedOutOfRange { speed: i64, max: u16 },

    #[error("heading {heading} outside [0, 360)")]
    HeadingOutOfRange { heading: f64 },

    #[error("`{action}` requires `{field}`")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },

    #[error("unknown sensor `{0}`")]
    UnknownSensor(String),
}

impl BridgeError {
    pub fn serial(reason: impl Into<String>) -> Self {
        BridgeError::SerialLink {
            reason: reason.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        BridgeError::NetworkLink {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_message() {
        let err = BridgeError::WatchdogTimeout {
            peer: Peer::Controller,
            silent_ms: 2100,
            window_ms: 2000,
        };
        assert_eq!(
            err.to_string(),
            "controller silent for 2100 ms (window 2000 ms)"
        );
    }

    #[test]
    fn test_validation_messages() {
        let err = ValidationError::SpeedOutOfRange { speed: 300, max: 255 };
        assert_eq!(err.to_string(), "speed 300 outside [0, 255]");

        let err = ValidationError::MissingField {
            action: "set_speed",
            field: "value",
        };
        assert_eq!(err.to_string(), "`set_speed` requires `value`");
    }

    #[test]
    fn test_config_error_converts() {
        let err: BridgeError = ConfigError::MissingKey("connection.host").into();
        assert!(matches!(err, BridgeError::Config(_)));
        assert!(err.to_string().contains("connection.host"));
    }
}
