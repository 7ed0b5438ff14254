//! Serial link to the robot's microcontroller
//!
//! One task owns the device: it writes commands in order, pings the
//! controller to keep the watchdog fed and reopens the port after failures.

mod link;

pub use link::{ControllerEvent, ControllerLink};
