//! Monotonic time source for liveness decisions

use std::sync::Arc;
use tokio::time::Instant;

/// Milliseconds since an arbitrary fixed origin
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// Clock backed by `tokio::time`, so paused-time tests drive it too
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
pub use manual::ManualClock;
