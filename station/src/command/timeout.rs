//! Timeout tracking for pending commands

use super::dispatcher::CommandDispatcher;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

/// Reports commands whose ack never arrived; they are never re-sent
pub struct TimeoutTracker {
    dispatcher: Arc<CommandDispatcher>,
    check_interval: Duration,
}

impl TimeoutTracker {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            dispatcher,
            check_interval: Duration::from_millis(1000),
        }
    }

    /// Start the timeout monitoring loop
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);

        loop {
            ticker.tick().await;

            for cmd in self.dispatcher.take_timed_out().await {
                warn!(
                    id = cmd.id,
                    command = %cmd.summary,
                    waited_ms = cmd.sent_at.elapsed().as_millis() as u64,
                    "Command timed out without ack"
                );
            }

            let stats = self.dispatcher.stats().await;
            if stats.pending > 0 {
                debug!(?stats, "Commands in flight");
            }
        }
    }
}
