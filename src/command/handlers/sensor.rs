//! sensor_control handler

use super::HandlerContext;
use crate::command::CommandResult;
use crate::error::ValidationError;
use firebot_shared::{ControllerCommand, SensorAction, SensorControl};

/// Calibration requests; only configured sensors can be calibrated
pub fn handle_sensor_control(ctx: &HandlerContext<'_>, cmd: &SensorControl) -> CommandResult {
    let command = match cmd.action {
        SensorAction::CalibrateAll => ControllerCommand::CalibrateAll,
        SensorAction::Calibrate => match cmd.sensor.as_deref() {
            None => {
                return CommandResult::rejected(ValidationError::MissingField {
                    action: "calibrate",
                    field: "sensor",
                })
            }
            Some(id) if !ctx.sensors.contains_key(id) => {
                return CommandResult::rejected(ValidationError::UnknownSensor(id.to_string()))
            }
            Some(id) => ControllerCommand::Calibrate {
                sensor: id.to_string(),
            },
        },
    };
    CommandResult::Forward { command }
}
