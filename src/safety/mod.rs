//! Safety Module
//!
//! Tracks liveness of both links and triggers the safe-stop when the
//! microcontroller goes quiet.

mod monitor;

pub use monitor::{LinkReporter, LinkSnapshot, SafetyAction, SafetyMonitor};
