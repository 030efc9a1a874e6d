//! Registry of live sessions.
//!
//! An entry exists exactly while its session is open: the gateway inserts it
//! before the session task starts and the session removes it on close.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// What the gateway keeps about a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Sending (or dropping) closes the session.
    pub cancel_tx: mpsc::Sender<()>,
    pub opened_at: Instant,
}

/// Session id → handle.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: u64, cancel_tx: mpsc::Sender<()>) {
        let handle = SessionHandle {
            cancel_tx,
            opened_at: Instant::now(),
        };
        self.sessions.write().await.insert(id, handle);
    }

    /// Returns `false` if the session was already gone.
    pub async fn remove(&self, id: u64) -> bool {
        match self.sessions.write().await.remove(&id) {
            Some(handle) => {
                debug!(id, duration_ms = handle.opened_at.elapsed().as_millis() as u64, "session removed");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ids of every open session, ascending.
    pub async fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ask one session to close. Returns `false` if it is not registered.
    pub async fn cancel(&self, id: u64) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(&id) {
            Some(handle) => {
                let _ = handle.cancel_tx.try_send(());
                true
            }
            None => false,
        }
    }

    /// Ask every session to close. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            let _ = handle.cancel_tx.try_send(());
        }
        sessions.len()
    }
}
