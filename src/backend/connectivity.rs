use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::events::ConnectivityStatus;

const CONNECTIVITY_CHANGED: &str = "CONNECTIVITY_CHANGED";

/// Shared view of the client's network reachability.
#[derive(Clone, Debug)]
pub struct ConnectivityTracker {
    inner: Arc<Mutex<TrackerState>>,
}

#[derive(Debug)]
struct TrackerState {
    status: ConnectivityStatus,
    changed_at: DateTime<Utc>,
    subscribers: Vec<mpsc::UnboundedSender<ConnectivityStatus>>,
}

/// A status change as observed by `record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityStatus,
    pub to: ConnectivityStatus,
}

impl Transition {
    pub fn came_online(&self) -> bool {
        !self.from.is_online() && self.to.is_online()
    }
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new(ConnectivityStatus::default())
    }
}

impl ConnectivityTracker {
    pub fn new(initial: ConnectivityStatus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerState {
                status: initial,
                changed_at: Utc::now(),
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.inner
            .lock()
            .map(|state| state.status)
            .unwrap_or(ConnectivityStatus::Disconnected)
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().map(|state| state.changed_at).ok()
    }

    /// Receives the current status immediately, then every change.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectivityStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.inner.lock() {
            let _ = tx.send(state.status);
            state.subscribers.push(tx);
        }
        rx
    }

    /// Records `status`; returns the transition when it differs from the current one.
    pub fn record(&self, status: ConnectivityStatus) -> Option<Transition> {
        let mut state = self.inner.lock().ok()?;
        if state.status == status {
            return None;
        }

        let transition = Transition {
            from: state.status,
            to: status,
        };
        state.status = status;
        state.changed_at = Utc::now();
        state.subscribers.retain(|sub| sub.send(status).is_ok());

        tracing::info!(
            code = CONNECTIVITY_CHANGED,
            from = ?transition.from,
            to = ?transition.to,
            "connectivity status changed"
        );

        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_initial_status_on_subscribe() {
        let tracker = ConnectivityTracker::new(ConnectivityStatus::Disconnected);
        let mut rx = tracker.subscribe();

        assert_eq!(rx.try_recv(), Ok(ConnectivityStatus::Disconnected));
    }

    #[test]
    fn only_connected_counts_as_online() {
        let tracker = ConnectivityTracker::default();
        assert!(!tracker.is_online());

        tracker.record(ConnectivityStatus::Connected);
        assert!(tracker.is_online());

        tracker.record(ConnectivityStatus::Disconnected);
        assert!(!tracker.is_online());
    }

    #[test]
    fn repeated_status_is_not_a_transition() {
        let tracker = ConnectivityTracker::new(ConnectivityStatus::Connected);

        assert_eq!(tracker.record(ConnectivityStatus::Connected), None);
    }

    #[test]
    fn reports_coming_online() {
        let tracker = ConnectivityTracker::new(ConnectivityStatus::Disconnected);

        let transition = tracker
            .record(ConnectivityStatus::Connected)
            .expect("status changed");

        assert!(transition.came_online());
    }

    #[test]
    fn notifies_subscribers_and_drops_closed_ones() {
        let tracker = ConnectivityTracker::new(ConnectivityStatus::Connecting);
        let mut live = tracker.subscribe();
        let dropped = tracker.subscribe();
        drop(dropped);

        tracker.record(ConnectivityStatus::Connected);

        assert_eq!(live.try_recv(), Ok(ConnectivityStatus::Connecting));
        assert_eq!(live.try_recv(), Ok(ConnectivityStatus::Connected));
        assert_eq!(
            tracker.inner.lock().expect("tracker lock").subscribers.len(),
            1
        );
    }
}
