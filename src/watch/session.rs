//! Watch session state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

pub use crate::ledger::SessionTotals;

/// Lifecycle of the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    /// No session task is running.
    Stopped,
    /// A session task is running cycles.
    Running,
    /// Stop was requested; the current cycle is finishing.
    Stopping,
}

impl WatchStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WatchStatus) -> bool {
        use WatchStatus::*;

        matches!(
            (self, target),
            (Stopped, Running) | (Running, Stopping) | (Running, Stopped) | (Stopping, Stopped)
        )
    }
}

impl std::fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

/// Stop request for one session. Checked between messages and wakes the
/// sleep between cycles.
#[derive(Debug, Default)]
pub struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Read-only copy of the session state handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSnapshot {
    pub status: WatchStatus,
    pub session_id: Option<Uuid>,
    /// Whether the session runs a single cycle.
    pub one_shot: bool,
    pub cycles: u64,
    pub totals: SessionTotals,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Mutable session state, owned by the controller behind a mutex.
#[derive(Debug)]
pub struct WatchSession {
    pub status: WatchStatus,
    pub session_id: Option<Uuid>,
    pub one_shot: bool,
    pub cycles: u64,
    pub totals: SessionTotals,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Stop request of this session only.
    pub stop: Arc<StopSignal>,
}

impl Default for WatchSession {
    fn default() -> Self {
        Self {
            status: WatchStatus::Stopped,
            session_id: None,
            one_shot: false,
            cycles: 0,
            totals: SessionTotals::default(),
            started_at: None,
            last_cycle_at: None,
            last_error: None,
            consecutive_failures: 0,
            stop: Arc::new(StopSignal::default()),
        }
    }
}

impl WatchSession {
    /// Move to `target` if the transition is legal.
    pub fn transition(&mut self, target: WatchStatus) -> bool {
        if self.status.can_transition_to(target) {
            self.status = target;
            true
        } else {
            false
        }
    }

    /// Reset counters for a fresh session and mark it running.
    /// Returns the new session id, or `None` if not stopped.
    pub fn begin(&mut self, one_shot: bool) -> Option<Uuid> {
        if !self.transition(WatchStatus::Running) {
            return None;
        }
        let id = Uuid::new_v4();
        self.session_id = Some(id);
        self.one_shot = one_shot;
        self.cycles = 0;
        self.totals = SessionTotals::default();
        self.started_at = Some(Utc::now());
        self.last_cycle_at = None;
        self.last_error = None;
        self.consecutive_failures = 0;
        self.stop = Arc::new(StopSignal::default());
        Some(id)
    }

    pub fn snapshot(&self) -> WatchSnapshot {
        WatchSnapshot {
            status: self.status,
            session_id: self.session_id,
            one_shot: self.one_shot,
            cycles: self.cycles,
            totals: self.totals,
            started_at: self.started_at,
            last_cycle_at: self.last_cycle_at,
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use WatchStatus::*;
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn invalid_transitions() {
        use WatchStatus::*;
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Stopped.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn begin_resets_and_assigns_new_id() {
        let mut s = WatchSession::default();
        let first = s.begin(false).unwrap();
        s.cycles = 4;
        s.totals.processed = 9;
        s.last_error = Some("boom".into());
        assert!(s.begin(false).is_none());

        assert!(s.transition(WatchStatus::Stopped));
        let second = s.begin(true).unwrap();
        assert_ne!(first, second);
        assert_eq!(s.cycles, 0);
        assert_eq!(s.totals, SessionTotals::default());
        assert!(s.last_error.is_none());
        assert!(s.one_shot);
    }

    #[test]
    fn new_session_gets_fresh_stop_signal() {
        let mut s = WatchSession::default();
        s.begin(false).unwrap();
        let old = Arc::clone(&s.stop);
        old.request();
        s.transition(WatchStatus::Stopped);

        s.begin(false).unwrap();
        assert!(old.is_requested());
        assert!(!s.stop.is_requested());
    }

    #[tokio::test]
    async fn stop_signal_wait_returns_after_request() {
        let signal = Arc::new(StopSignal::default());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };
        signal.request();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        signal.wait().await;
    }

    #[test]
    fn snapshot_serializes_status() {
        let s = WatchSession::default();
        let json = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(json["status"], "stopped");
        assert!(json["session_id"].is_null());
    }
}
