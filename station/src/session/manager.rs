//! Session manager for tracking connected bridges

use super::connection::SessionHandle;
use firebot_shared::StationMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Manages all active bridge sessions
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SocketAddr, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.addr, handle);
    }

    pub async fn unregister(&self, addr: &SocketAddr) {
        self.sessions.write().await.remove(addr);
    }

    /// Send a message to every connected bridge, returning how many got it
    pub async fn broadcast(&self, msg: &StationMessage) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for (addr, handle) in sessions.iter() {
            match handle.send(msg).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%addr, error = %e, "Failed to send"),
            }
        }
        delivered
    }

    /// Close and remove sessions that have been silent past the timeout
    pub async fn remove_dead_sessions(&self) -> Vec<SocketAddr> {
        let mut sessions = self.sessions.write().await;
        let mut dead = Vec::new();
        for (addr, handle) in sessions.iter() {
            if !handle.is_alive().await {
                dead.push(*addr);
            }
        }
        for addr in &dead {
            if let Some(handle) = sessions.remove(addr) {
                handle.close();
            }
        }
        dead
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
