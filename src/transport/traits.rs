//! Transport trait abstraction for the serial and TCP links

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream to one peer
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Flush and close the stream
    async fn shutdown(&mut self) -> Result<()>;
}

/// Factory for opening a link to a peer
///
/// Link tasks hold a connector and call `connect` again on every retry, so
/// implementations must be reusable.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// The stream type this connector produces
    type Stream: TransportStream;

    /// Attempt to connect, returning a stream on success
    async fn connect(&self) -> Result<Self::Stream>;

    /// Human-readable endpoint description for logs
    fn name(&self) -> &str;
}
