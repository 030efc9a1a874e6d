//! Inactivity tracking shared by sessions and daemon links.

use std::time::Duration;
use tokio::time::{self, Instant};

/// Tracks the last inbound activity of one connection.
///
/// Owned by the task that drives the connection, so it is dropped (and its
/// timer with it) on every exit path.
#[derive(Debug)]
pub struct InactivityMonitor {
    threshold: Option<Duration>,
    last_activity: Instant,
}

impl InactivityMonitor {
    /// `None` or a zero threshold disables the monitor.
    pub fn new(threshold: Option<Duration>) -> Self {
        Self {
            threshold: threshold.filter(|t| !t.is_zero()),
            last_activity: Instant::now(),
        }
    }

    /// Record inbound activity, pushing the deadline back.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Disarm; [`expired`](Self::expired) never resolves afterwards.
    pub fn stop(&mut self) {
        self.threshold = None;
    }

    /// Resolves once no activity has been recorded for the threshold.
    ///
    /// Cancel-safe: meant to be raced in `tokio::select!` and recreated after
    /// every [`touch`](Self::touch).
    pub async fn expired(&self) {
        let Some(threshold) = self.threshold else {
            return std::future::pending().await;
        };
        let deadline = self.last_activity + threshold;
        if Instant::now() < deadline {
            time::sleep_until(deadline).await;
        }
    }
}
