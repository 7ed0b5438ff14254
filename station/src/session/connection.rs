//! Individual bridge session handling

use anyhow::Result;
use firebot_shared::{
    codec::{self, FrameDecoder},
    liveness, BridgeMessage, StationMessage,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to send messages to a specific bridge
#[derive(Clone)]
pub struct SessionHandle {
    pub addr: SocketAddr,
    writer: Arc<Mutex<Writer>>,
    pub connected_at: Instant,
    last_seen: Arc<Mutex<Instant>>,
    closed: Arc<Notify>,
}

impl SessionHandle {
    /// Send one message to this bridge
    pub async fn send(&self, msg: &StationMessage) -> Result<()> {
        let encoded = codec::encode(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// True while the bridge has spoken within the session timeout
    pub async fn is_alive(&self) -> bool {
        self.time_since_seen().await < Duration::from_millis(liveness::SESSION_TIMEOUT_MS)
    }

    pub async fn mark_seen(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    pub async fn time_since_seen(&self) -> Duration {
        self.last_seen.lock().await.elapsed()
    }

    /// Ask the session reader to stop
    pub fn close(&self) {
        self.closed.notify_one();
    }
}

/// Active bridge session
pub struct BridgeSession<S> {
    handle: SessionHandle,
    reader: ReadHalf<S>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl<S> BridgeSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let now = Instant::now();

        let handle = SessionHandle {
            addr,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            connected_at: now,
            last_seen: Arc::new(Mutex::new(now)),
            closed: Arc::new(Notify::new()),
        };

        Self {
            handle,
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending messages
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next message from the bridge
    ///
    /// Returns None once the connection is closed or the session was closed
    /// through its handle. Malformed lines are logged and skipped.
    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        loop {
            match self.decoder.decode_next::<BridgeMessage>() {
                Ok(Some(msg)) => {
                    self.handle.mark_seen().await;
                    return Some(msg);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(addr = %self.handle.addr, error = %e, "Dropping malformed line");
                    continue;
                }
            }

            let read = tokio::select! {
                r = self.reader.read(&mut self.read_buf) => r,
                _ = self.handle.closed.notified() => return None,
            };
            match read {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    warn!(addr = %self.handle.addr, error = %e, "Read error");
                    return None;
                }
            }
        }
    }
}
