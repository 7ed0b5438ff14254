//! Command handlers for the station command families

mod drive;
mod sensor;

pub use drive::handle_robot_control;
pub use sensor::handle_sensor_control;

use crate::config::{NavigationConfig, SensorThreshold};
use std::collections::BTreeMap;

/// Context passed to command handlers
#[derive(Debug, Clone)]
pub struct HandlerContext<'a> {
    pub navigation: &'a NavigationConfig,
    pub sensors: &'a BTreeMap<String, SensorThreshold>,
    /// Speed used by motion commands that do not carry one
    pub current_speed: u16,
    pub command_id: u64,
}
