//! Command dispatcher for sending commands to the bridge

use crate::session::SessionManager;
use anyhow::{bail, Result};
use firebot_shared::{liveness, Ack, AckStatus, StationMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

/// A sent command awaiting its ack
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub id: u64,
    pub summary: String,
    pub sent_at: Instant,
}

impl PendingCommand {
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) > Duration::from_millis(liveness::COMMAND_ACK_TIMEOUT_MS)
    }
}

/// Command bookkeeping
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub pending: usize,
    pub completed: u64,
    pub timed_out: u64,
}

/// Dispatches commands to connected bridges and tracks their acks
pub struct CommandDispatcher {
    sessions: Arc<SessionManager>,
    command_id: AtomicU64,
    pending: RwLock<HashMap<u64, PendingCommand>>,
    completed: AtomicU64,
    timed_out: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            command_id: AtomicU64::new(0),
            pending: RwLock::new(HashMap::new()),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn next_command_id(&self) -> u64 {
        self.command_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Assign a fresh id to a command and send it to every bridge
    pub async fn send_command(&self, mut msg: StationMessage) -> Result<u64> {
        let id = self.next_command_id();
        let summary = match &mut msg {
            StationMessage::RobotControl(cmd) => {
                cmd.id = id;
                format!("{:?}", cmd.action)
            }
            StationMessage::SensorControl(cmd) => {
                cmd.id = id;
                format!("{:?}", cmd.action)
            }
            StationMessage::Heartbeat(_) | StationMessage::HeartbeatAck(_) => {
                bail!("not a command")
            }
        };

        self.pending.write().await.insert(
            id,
            PendingCommand {
                id,
                summary: summary.clone(),
                sent_at: Instant::now(),
            },
        );

        if self.sessions.broadcast(&msg).await == 0 {
            self.pending.write().await.remove(&id);
            bail!("no bridge connected");
        }

        info!(id, command = %summary, ">>> Sent command");
        Ok(id)
    }

    /// Resolve a pending command; returns it if the id was known
    pub async fn handle_ack(&self, ack: &Ack) -> Option<PendingCommand> {
        let Some(cmd) = self.pending.write().await.remove(&ack.id) else {
            warn!(id = ack.id, "<<< Ack for unknown command");
            return None;
        };
        self.completed.fetch_add(1, Ordering::Relaxed);

        let elapsed_ms = cmd.sent_at.elapsed().as_millis() as u64;
        match ack.status {
            AckStatus::Accepted => info!(id = ack.id, elapsed_ms, "<<< Accepted"),
            AckStatus::Rejected | AckStatus::Failed => warn!(
                id = ack.id,
                status = ?ack.status,
                message = %ack.message,
                elapsed_ms,
                "<<< Not executed"
            ),
        }
        Some(cmd)
    }

    /// Remove and return commands whose ack never arrived
    pub async fn take_timed_out(&self) -> Vec<PendingCommand> {
        let now = Instant::now();
        let mut pending = self.pending.write().await;
        let expired: Vec<u64> = pending
            .values()
            .filter(|c| c.is_timed_out(now))
            .map(|c| c.id)
            .collect();

        let timed_out: Vec<PendingCommand> = expired
            .iter()
            .filter_map(|id| pending.remove(id))
            .collect();
        self.timed_out
            .fetch_add(timed_out.len() as u64, Ordering::Relaxed);
        timed_out
    }

    pub async fn stats(&self) -> DispatchStats {
        DispatchStats {
            pending: self.pending.read().await.len(),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
