//! Serial transport to the microcontroller

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// The port itself is closed when the stream is dropped
#[async_trait]
impl TransportStream for SerialStream {
    async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        Ok(())
    }
}

/// Opens the configured serial device
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl TransportConnector for SerialConnector {
    type Stream = SerialStream;

    async fn connect(&self) -> Result<Self::Stream> {
        #[allow(unused_mut)]
        let mut port = tokio_serial::new(&self.path, self.baud_rate)
            .open_native_async()
            .with_context(|| format!("open {} at {} baud", self.path, self.baud_rate))?;

        // Refuse a second opener while we hold the device
        #[cfg(unix)]
        port.set_exclusive(true)
            .with_context(|| format!("lock {}", self.path))?;

        Ok(port)
    }

    fn name(&self) -> &str {
        &self.path
    }
}
