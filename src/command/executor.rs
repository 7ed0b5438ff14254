//! Command executor - validates station commands and decides their ack

use super::handlers::{self, HandlerContext};
use crate::config::BridgeConfig;
use crate::error::ValidationError;
use firebot_shared::{Ack, ControllerCommand, LinkState, StationMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a handler
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Valid; send this to the controller
    Forward { command: ControllerCommand },
    /// Outside the configured bounds
    Rejected { message: String },
    /// Valid but cannot be delivered right now
    Failed { message: String },
}

impl CommandResult {
    pub fn rejected(err: ValidationError) -> Self {
        CommandResult::Rejected {
            message: err.to_string(),
        }
    }
}

/// What the bridge should do with one station command
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub ack: Ack,
    /// Present only for accepted commands
    pub command: Option<ControllerCommand>,
}

/// Validates station commands and tracks robot motion
pub struct CommandExecutor {
    config: Arc<BridgeConfig>,
    current_speed: u16,
    moving: bool,
    last_motion_ms: u64,
}

impl CommandExecutor {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        let current_speed = config.navigation.default_speed;
        Self {
            config,
            current_speed,
            moving: false,
            last_motion_ms: 0,
        }
    }

    pub fn current_speed(&self) -> u16 {
        self.current_speed
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    /// Execute a command and return its ack plus the command to forward
    ///
    /// Motion state is left alone until [`note_delivered`](Self::note_delivered)
    /// confirms the command reached the controller queue. Returns `None` for
    /// messages that are not commands.
    pub fn execute(&self, msg: &StationMessage, controller: LinkState) -> Option<Dispatch> {
        let id = msg.command_id()?;
        let ctx = HandlerContext {
            navigation: &self.config.navigation,
            sensors: &self.config.sensors,
            current_speed: self.current_speed,
            command_id: id,
        };

        let result = match msg {
            StationMessage::RobotControl(cmd) => handlers::handle_robot_control(&ctx, cmd),
            StationMessage::SensorControl(cmd) => handlers::handle_sensor_control(&ctx, cmd),
            StationMessage::Heartbeat(_) | StationMessage::HeartbeatAck(_) => return None,
        };

        let result = match result {
            CommandResult::Forward { command } if !deliverable(&command, controller) => {
                CommandResult::Failed {
                    message: format!("controller link is {controller}"),
                }
            }
            other => other,
        };

        // Convert result to ack
        let dispatch = match result {
            CommandResult::Forward { command } => {
                debug!(id, ?command, "Command accepted");
                Dispatch {
                    ack: Ack::accepted(id, ""),
                    command: Some(command),
                }
            }
            CommandResult::Rejected { message } => {
                warn!(id, %message, "Command rejected");
                Dispatch {
                    ack: Ack::rejected(id, message),
                    command: None,
                }
            }
            CommandResult::Failed { message } => {
                warn!(id, %message, "Command failed");
                Dispatch {
                    ack: Ack::failed(id, message),
                    command: None,
                }
            }
        };
        Some(dispatch)
    }

    /// Record a command the controller link has taken
    pub fn note_delivered(&mut self, command: &ControllerCommand, now_ms: u64) {
        match command {
            ControllerCommand::Drive { .. } => {
                self.moving = true;
                self.last_motion_ms = now_ms;
            }
            ControllerCommand::SetSpeed { speed } => {
                self.current_speed = *speed;
                self.last_motion_ms = now_ms;
            }
            ControllerCommand::Stop => self.moving = false,
            _ => {}
        }
    }

    /// The motors were stopped outside the command path (watchdog)
    pub fn note_stopped(&mut self) {
        self.moving = false;
    }

    /// True once if the robot has been moving without a command for too long
    pub fn check_auto_stop(&mut self, now_ms: u64) -> bool {
        let timeout_ms = self.config.navigation.auto_stop_timeout().as_millis() as u64;
        if self.moving && now_ms.saturating_sub(self.last_motion_ms) >= timeout_ms {
            info!(
                idle_ms = now_ms.saturating_sub(self.last_motion_ms),
                "No motion command received, auto-stopping"
            );
            self.moving = false;
            return true;
        }
        false
    }
}

/// Stop may still get through a Degraded link; everything else needs Connected
fn deliverable(command: &ControllerCommand, controller: LinkState) -> bool {
    match controller {
        LinkState::Connected => true,
        LinkState::Degraded => matches!(command, ControllerCommand::Stop),
        LinkState::Connecting | LinkState::Disconnected => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firebot_shared::{
        AckStatus, Direction, DriveAction, Heartbeat, RobotControl, SensorAction, SensorControl,
    };

    fn executor() -> CommandExecutor {
        CommandExecutor::new(Arc::new(BridgeConfig::default()))
    }

    /// Execute and, if accepted, record delivery
    fn deliver(exec: &mut CommandExecutor, msg: &StationMessage, now_ms: u64) -> Dispatch {
        let d = exec.execute(msg, LinkState::Connected).unwrap();
        if let Some(command) = &d.command {
            exec.note_delivered(command, now_ms);
        }
        d
    }

    fn robot(id: u64, action: DriveAction, speed: Option<i64>) -> StationMessage {
        StationMessage::RobotControl(RobotControl {
            id,
            action,
            speed,
            heading: None,
            value: None,
        })
    }

    #[test]
    fn test_accepted_command_is_forwarded() {
        let mut exec = executor();
        let d = exec
            .execute(&robot(1, DriveAction::Forward, Some(120)), LinkState::Connected)
            .unwrap();
        assert_eq!(d.ack, Ack::accepted(1, ""));
        assert_eq!(
            d.command,
            Some(ControllerCommand::Drive {
                direction: Direction::Forward,
                speed: 120,
                heading: None
            })
        );
        assert!(!exec.is_moving(), "not moving until delivered");

        exec.note_delivered(d.command.as_ref().unwrap(), 0);
        assert!(exec.is_moving());
    }

    #[test]
    fn test_undelivered_commands_leave_state_untouched() {
        let mut exec = executor();
        deliver(&mut exec, &robot(1, DriveAction::Forward, None), 1_000);

        // Accepted but never queued
        let stop = exec
            .execute(&robot(2, DriveAction::Stop, None), LinkState::Connected)
            .unwrap();
        assert_eq!(stop.command, Some(ControllerCommand::Stop));
        let set = StationMessage::RobotControl(RobotControl {
            id: 3,
            action: DriveAction::SetSpeed,
            speed: None,
            heading: None,
            value: Some(40),
        });
        exec.execute(&set, LinkState::Connected).unwrap();

        assert!(exec.is_moving());
        assert_eq!(exec.current_speed(), 150);
        assert!(exec.check_auto_stop(31_000));
    }

    #[test]
    fn test_rejected_command_is_not_forwarded() {
        let mut exec = executor();
        let d = deliver(&mut exec, &robot(2, DriveAction::Forward, Some(300)), 0);
        assert_eq!(d.ack.status, AckStatus::Rejected);
        assert_eq!(d.ack.message, "speed 300 outside [0, 255]");
        assert!(d.command.is_none());
        assert!(!exec.is_moving());
    }

    #[test]
    fn test_invalid_command_rejected_even_when_disconnected() {
        let exec = executor();
        let d = exec
            .execute(&robot(3, DriveAction::Left, Some(-5)), LinkState::Disconnected)
            .unwrap();
        assert_eq!(d.ack.status, AckStatus::Rejected);
    }

    #[test]
    fn test_valid_command_fails_without_controller() {
        let exec = executor();
        let d = exec
            .execute(&robot(4, DriveAction::Forward, None), LinkState::Connecting)
            .unwrap();
        assert_eq!(d.ack.status, AckStatus::Failed);
        assert_eq!(d.ack.message, "controller link is connecting");
        assert!(d.command.is_none());
    }

    #[test]
    fn test_stop_allowed_on_degraded_link() {
        let exec = executor();
        let d = exec
            .execute(&robot(5, DriveAction::Stop, None), LinkState::Degraded)
            .unwrap();
        assert_eq!(d.command, Some(ControllerCommand::Stop));

        let d = exec
            .execute(&robot(6, DriveAction::Forward, None), LinkState::Degraded)
            .unwrap();
        assert_eq!(d.ack.status, AckStatus::Failed);
    }

    #[test]
    fn test_set_speed_changes_default_for_motion() {
        let mut exec = executor();
        let set = StationMessage::RobotControl(RobotControl {
            id: 7,
            action: DriveAction::SetSpeed,
            speed: None,
            heading: None,
            value: Some(90),
        });
        deliver(&mut exec, &set, 0);
        assert_eq!(exec.current_speed(), 90);

        let d = deliver(&mut exec, &robot(8, DriveAction::Backward, None), 0);
        assert!(matches!(
            d.command,
            Some(ControllerCommand::Drive { speed: 90, .. })
        ));
    }

    #[test]
    fn test_sensor_command() {
        let mut exec = executor();
        let msg = StationMessage::SensorControl(SensorControl {
            id: 9,
            action: SensorAction::Calibrate,
            sensor: Some("mq2".into()),
        });
        let d = deliver(&mut exec, &msg, 0);
        assert_eq!(d.ack.status, AckStatus::Accepted);
        assert!(!exec.is_moving());
    }

    #[test]
    fn test_heartbeat_is_not_a_command() {
        let exec = executor();
        let hb = StationMessage::Heartbeat(Heartbeat {
            seq: 1,
            timestamp_ms: 0,
        });
        assert!(exec.execute(&hb, LinkState::Connected).is_none());
    }

    #[test]
    fn test_auto_stop_after_inactivity() {
        let mut exec = executor();
        deliver(&mut exec, &robot(1, DriveAction::Forward, None), 1_000);

        assert!(!exec.check_auto_stop(30_999));
        assert!(exec.check_auto_stop(31_000));
        // Only once
        assert!(!exec.check_auto_stop(40_000));
    }

    #[test]
    fn test_no_auto_stop_when_idle_or_stopped() {
        let mut exec = executor();
        assert!(!exec.check_auto_stop(100_000));

        deliver(&mut exec, &robot(1, DriveAction::Forward, None), 0);
        deliver(&mut exec, &robot(2, DriveAction::Stop, None), 10);
        assert!(!exec.check_auto_stop(100_000));

        deliver(&mut exec, &robot(3, DriveAction::Forward, None), 0);
        exec.note_stopped();
        assert!(!exec.check_auto_stop(100_000));
    }
}
