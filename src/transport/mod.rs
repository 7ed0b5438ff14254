//! Byte-stream transports for the two bridge links
//!
//! - `tcp`: outbound connection to the control station
//! - `serial`: UART to the microcontroller

#[cfg(test)]
pub mod mock;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use serial::SerialConnector;
pub use tcp::TcpConnector;
pub use traits::{TransportConnector, TransportStream};
