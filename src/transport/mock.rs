//! In-memory transport for link and bridge tests

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Connector handing out pre-queued duplex streams
///
/// Models an exclusive device: while a stream it produced is alive, further
/// connects fail with "busy". An empty queue fails like a refused connection.
#[derive(Clone)]
pub struct MockConnector {
    name: String,
    queue: Arc<Mutex<VecDeque<DuplexStream>>>,
    in_use: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            in_use: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a stream for the next connect and return the peer end
    pub fn push_stream(&self) -> DuplexStream {
        self.push_stream_with_capacity(64 * 1024)
    }

    /// Like [`push_stream`](Self::push_stream), buffering at most `capacity`
    /// unread bytes in each direction
    pub fn push_stream_with_capacity(&self, capacity: usize) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(capacity);
        self.queue.lock().unwrap().push_back(ours);
        theirs
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    type Stream = MockStream;

    async fn connect(&self) -> Result<Self::Stream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.in_use.load(Ordering::SeqCst) {
            return Err(anyhow!("{} busy", self.name));
        }
        let inner = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("{} refused", self.name))?;
        self.in_use.store(true, Ordering::SeqCst);
        Ok(MockStream {
            inner,
            in_use: self.in_use.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Stream produced by [`MockConnector`]; releases the device on drop
pub struct MockStream {
    inner: DuplexStream,
    in_use: Arc<AtomicBool>,
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::SeqCst);
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for MockStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}
