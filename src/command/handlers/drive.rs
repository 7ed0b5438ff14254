//! robot_control handler

use super::HandlerContext;
use crate::command::CommandResult;
use crate::error::ValidationError;
use firebot_shared::{ControllerCommand, Direction, DriveAction, RobotControl};
use tracing::debug;

/// Validate a motion command against the navigation limits
pub fn handle_robot_control(ctx: &HandlerContext<'_>, cmd: &RobotControl) -> CommandResult {
    match translate(ctx, cmd) {
        Ok(command) => {
            debug!(id = ctx.command_id, ?command, "Motion command validated");
            CommandResult::Forward { command }
        }
        Err(e) => CommandResult::Rejected {
            message: e.to_string(),
        },
    }
}

fn translate(ctx: &HandlerContext<'_>, cmd: &RobotControl) -> Result<ControllerCommand, ValidationError> {
    let max = ctx.navigation.max_speed;
    let speed = cmd.speed.map(|s| check_speed(s, max)).transpose()?;
    let heading = cmd.heading.map(check_heading).transpose()?;

    let direction = match cmd.action {
        DriveAction::Stop => return Ok(ControllerCommand::Stop),
        DriveAction::SetSpeed => {
            let value = cmd.value.ok_or(ValidationError::MissingField {
                action: "set_speed",
                field: "value",
            })?;
            return Ok(ControllerCommand::SetSpeed {
                speed: check_speed(value, max)?,
            });
        }
        DriveAction::Forward => Direction::Forward,
        DriveAction::Backward => Direction::Backward,
        DriveAction::Left => Direction::Left,
        DriveAction::Right => Direction::Right,
        DriveAction::SoftLeft => Direction::SoftLeft,
        DriveAction::SoftRight => Direction::SoftRight,
    };

    Ok(ControllerCommand::Drive {
        direction,
        speed: speed.unwrap_or(ctx.current_speed),
        heading,
    })
}

fn check_speed(speed: i64, max: u16) -> Result<u16, ValidationError> {
    if (0..=i64::from(max)).contains(&speed) {
        Ok(speed as u16)
    } else {
        Err(ValidationError::SpeedOutOfRange { speed, max })
    }
}

fn check_heading(heading: f64) -> Result<f64, ValidationError> {
    if (0.0..360.0).contains(&heading) {
        Ok(heading)
    } else {
        Err(ValidationError::HeadingOutOfRange { heading })
    }
}
