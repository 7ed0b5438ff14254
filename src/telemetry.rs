//! Telemetry annotation
//!
//! Turns a controller sensor frame into the station telemetry message: every
//! reading gets an alert flag and the frame gets a sequence number and a
//! timestamp. Readings are listed by sensor id.

use crate::config::SensorThreshold;
use firebot_shared::{Reading, Telemetry};
use std::collections::BTreeMap;

pub struct TelemetryAnnotator {
    thresholds: BTreeMap<String, SensorThreshold>,
    seq: u64,
}

impl TelemetryAnnotator {
    pub fn new(thresholds: BTreeMap<String, SensorThreshold>) -> Self {
        Self {
            thresholds,
            seq: 0,
        }
    }

    /// Annotate one frame
    ///
    /// Sensors without a configured threshold are passed through unflagged.
    pub fn annotate(&mut self, readings: &BTreeMap<String, f64>, timestamp_ms: u64) -> Telemetry {
        self.seq += 1;
        let readings = readings
            .iter()
            .map(|(sensor, &value)| Reading {
                sensor: sensor.clone(),
                value,
                alert: self
                    .thresholds
                    .get(sensor)
                    .is_some_and(|t| t.is_alert(value)),
            })
            .collect();

        Telemetry {
            seq: self.seq,
            timestamp_ms,
            readings,
        }
    }
}
