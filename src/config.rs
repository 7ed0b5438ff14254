//! Bridge configuration
//!
//! Loaded once at startup from a TOML file and shared read-only (`Arc`)
//! with every task. Any problem here is fatal: the bridge never starts on
//! a partial configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("missing configuration key `{0}`")]
    MissingKey(&'static str),

    #[error("invalid `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Full bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default = "default_sensors")]
    pub sensors: BTreeMap<String, SensorThreshold>,
    #[serde(default)]
    pub lidar: LidarConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub navigation: NavigationConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            serial: SerialConfig::default(),
            sensors: default_sensors(),
            lidar: LidarConfig::default(),
            camera: CameraConfig::default(),
            navigation: NavigationConfig::default(),
            ui: UiConfig::default(),
        }
    }
}

/// Control-station link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Seconds; also the station heartbeat window
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: f64,
    /// Heartbeat windows the station may miss before the link is dropped
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// Consecutive failed attempts before the link is reported as failed
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,
    /// Seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".into(),
            port: 9999,
            auto_reconnect: true,
            reconnect_interval: default_reconnect_interval(),
            missed_heartbeats: default_missed_heartbeats(),
            max_reconnect_attempts: default_max_attempts(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl ConnectionConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout)
    }
}

/// Microcontroller link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Milliseconds of controller silence before a safe-stop
    pub watchdog_timeout: u64,
    /// Consecutive failed opens before the link is fatal
    pub max_retries: u32,
    /// Milliseconds between pings to the controller
    pub ping_interval: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            watchdog_timeout: 2000,
            max_retries: 5,
            ping_interval: 500,
        }
    }
}

impl SerialConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }
}

/// Alert threshold for one sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorThreshold {
    pub threshold: f64,
    /// Offset subtracted from raw readings; absent means no correction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<f64>,
}

impl SensorThreshold {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            calibration: None,
        }
    }

    /// True when the corrected reading exceeds the threshold
    pub fn is_alert(&self, raw: f64) -> bool {
        raw - self.calibration.unwrap_or(0.0) > self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LidarConfig {
    pub enabled: bool,
    /// Hz
    pub scan_frequency: u32,
    /// Millimetres
    pub max_distance: u32,
}

impl Default for LidarConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_frequency: 5,
            max_distance: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub resolution: [u32; 2],
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resolution: [640, 480],
            fps: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub default_speed: u16,
    pub max_speed: u16,
    /// Seconds without a motion command before the robot is stopped
    pub auto_stop_timeout: f64,
    /// Millimetres
    pub obstacle_threshold: u32,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            default_speed: 150,
            max_speed: 255,
            auto_stop_timeout: 30.0,
            obstacle_threshold: 500,
        }
    }
}

impl NavigationConfig {
    pub fn auto_stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.auto_stop_timeout)
    }
}

/// Station-side display preferences, kept so a shared file round-trips
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub theme: String,
    pub language: String,
    pub sound_alerts: bool,
    pub show_statistics: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            theme: "light".into(),
            language: "ca".into(),
            sound_alerts: true,
            show_statistics: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval() -> f64 {
    5.0
}

fn default_missed_heartbeats() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_sensors() -> BTreeMap<String, SensorThreshold> {
    [
        ("mq2", 400.0),
        ("mq135", 100.0),
        ("temp", 50.0),
        ("flame", 1.0),
        ("sound", 500.0),
        ("mpu", 2.0),
        ("bat", 10.0),
    ]
    .into_iter()
    .map(|(id, t)| (id.to_string(), SensorThreshold::new(t)))
    .collect()
}

impl BridgeConfig {
    /// Read, parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content)?;
        let connection = table
            .get("connection")
            .and_then(|v| v.as_table())
            .ok_or(ConfigError::MissingKey("connection"))?;
        for (key, path) in [("host", "connection.host"), ("port", "connection.port")] {
            if !connection.contains_key(key) {
                return Err(ConfigError::MissingKey(path));
            }
        }

        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration to disk
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every invariant the bridge relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        if c.host.trim().is_empty() {
            return Err(ConfigError::invalid("connection.host", "must not be empty"));
        }
        if c.port == 0 {
            return Err(ConfigError::invalid("connection.port", "must be non-zero"));
        }
        positive_secs("connection.reconnect_interval", c.reconnect_interval)?;
        positive_secs("connection.connect_timeout", c.connect_timeout)?;
        if c.missed_heartbeats == 0 {
            return Err(ConfigError::invalid(
                "connection.missed_heartbeats",
                "must be at least 1",
            ));
        }

        let s = &self.serial;
        if s.port.trim().is_empty() {
            return Err(ConfigError::invalid("serial.port", "must not be empty"));
        }
        if s.baud_rate == 0 {
            return Err(ConfigError::invalid("serial.baud_rate", "must be non-zero"));
        }
        if s.watchdog_timeout == 0 {
            return Err(ConfigError::invalid(
                "serial.watchdog_timeout",
                "must be non-zero",
            ));
        }
        if s.ping_interval == 0 || s.ping_interval >= s.watchdog_timeout {
            return Err(ConfigError::invalid(
                "serial.ping_interval",
                format!(
                    "must be in (0, watchdog_timeout = {})",
                    s.watchdog_timeout
                ),
            ));
        }

        for (id, t) in &self.sensors {
            if !t.threshold.is_finite() || t.threshold <= 0.0 {
                return Err(ConfigError::invalid(
                    format!("sensors.{id}.threshold"),
                    format!("must be a positive number, got {}", t.threshold),
                ));
            }
            if let Some(cal) = t.calibration {
                if !cal.is_finite() {
                    return Err(ConfigError::invalid(
                        format!("sensors.{id}.calibration"),
                        "must be finite",
                    ));
                }
            }
        }

        if self.lidar.enabled && self.lidar.scan_frequency == 0 {
            return Err(ConfigError::invalid(
                "lidar.scan_frequency",
                "must be positive when lidar is enabled",
            ));
        }

        let cam = &self.camera;
        if cam.enabled && (cam.resolution[0] == 0 || cam.resolution[1] == 0 || cam.fps == 0) {
            return Err(ConfigError::invalid(
                "camera",
                "resolution and fps must be positive when camera is enabled",
            ));
        }

        let nav = &self.navigation;
        if nav.default_speed > nav.max_speed {
            return Err(ConfigError::invalid(
                "navigation.default_speed",
                format!("{} exceeds max_speed {}", nav.default_speed, nav.max_speed),
            ));
        }
        positive_secs("navigation.auto_stop_timeout", nav.auto_stop_timeout)?;

        Ok(())
    }
}

/// Longest interval or timeout accepted from the config, in seconds
const MAX_SECS: f64 = 86_400.0;

fn positive_secs(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= MAX_SECS {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            key,
            format!("must be in (0, {MAX_SECS}] seconds, got {value}"),
        ))
    }
}
