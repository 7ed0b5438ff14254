//! Operator input
//!
//! Reads commands from stdin, one per line, either as full JSON messages or
//! in shorthand:
//!
//! ```text
//! forward 150 90      action [speed] [heading]
//! stop
//! speed 200
//! calibrate mq2
//! calibrate_all
//! ```
//!
//! Ids are assigned by the dispatcher, so any id given here is replaced.

use crate::command::CommandDispatcher;
use anyhow::{anyhow, bail, Context, Result};
use firebot_shared::{DriveAction, RobotControl, SensorAction, SensorControl, StationMessage};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Parse one operator line; blank lines and `#` comments yield None
pub fn parse_line(line: &str) -> Result<Option<StationMessage>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    if line.starts_with('{') {
        let msg: StationMessage = serde_json::from_str(line).context("invalid JSON command")?;
        if msg.command_id().is_none() {
            bail!("only robot_control and sensor_control can be sent");
        }
        return Ok(Some(msg));
    }

    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = words.collect();

    let msg = match (verb.as_str(), args.as_slice()) {
        ("speed" | "set_speed", [value]) => robot(DriveAction::SetSpeed, None, None, Some(int(value)?)),
        ("speed" | "set_speed", _) => bail!("usage: speed <value>"),
        ("stop", []) => robot(DriveAction::Stop, None, None, None),
        ("calibrate", ["all"]) | ("calibrate_all", []) => sensor(SensorAction::CalibrateAll, None),
        ("calibrate", [id]) => sensor(SensorAction::Calibrate, Some(id.to_string())),
        ("calibrate", _) => bail!("usage: calibrate <sensor>|all"),
        (verb, args) => {
            let action: DriveAction = serde_json::from_value(serde_json::Value::from(verb))
                .map_err(|_| anyhow!("unknown command `{verb}`"))?;
            if matches!(action, DriveAction::Stop | DriveAction::SetSpeed) {
                bail!("unexpected arguments for `{verb}`");
            }
            match args {
                [] => robot(action, None, None, None),
                [speed] => robot(action, Some(int(speed)?), None, None),
                [speed, heading] => {
                    let heading = heading
                        .parse::<f64>()
                        .with_context(|| format!("invalid heading `{heading}`"))?;
                    robot(action, Some(int(speed)?), Some(heading), None)
                }
                _ => bail!("usage: {verb} [speed] [heading]"),
            }
        }
    };
    Ok(Some(msg))
}

fn int(s: &str) -> Result<i64> {
    s.parse().with_context(|| format!("invalid number `{s}`"))
}

fn robot(
    action: DriveAction,
    speed: Option<i64>,
    heading: Option<f64>,
    value: Option<i64>,
) -> StationMessage {
    StationMessage::RobotControl(RobotControl {
        id: 0,
        action,
        speed,
        heading,
        value,
    })
}

fn sensor(action: SensorAction, sensor: Option<String>) -> StationMessage {
    StationMessage::SensorControl(SensorControl { id: 0, action, sensor })
}

/// Forward stdin commands until stdin closes
pub async fn run_stdin(dispatcher: Arc<CommandDispatcher>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };

        match parse_line(&line) {
            Ok(Some(msg)) => {
                if let Err(e) = dispatcher.send_command(msg).await {
                    warn!(error = %e, "Command not sent");
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring input: {e:#}"),
        }
    }
    info!("Operator input closed");
}
