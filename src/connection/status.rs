//! Connection Status Fan-out
//!
//! Four-state connection model plus an observer list. Redundant updates
//! (same state, same message) are swallowed; every distinct transition is
//! delivered synchronously to each listener, and a panicking listener does
//! not prevent the others from running.

use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// State plus optional message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            message: None,
        }
    }
}

/// Callback invoked on every distinct transition
pub type StatusListener = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;

/// Handle returned by registration, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct NotifierState {
    current: StatusSnapshot,
    listeners: Vec<(ListenerId, StatusListener)>,
    next_id: u64,
}

/// Observer list for status transitions
#[derive(Default)]
pub struct StatusNotifier {
    state: Mutex<NotifierState>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state().current.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().current.status
    }

    /// Register a listener
    pub fn subscribe(&self, listener: StatusListener) -> ListenerId {
        let mut state = self.state();
        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state.listeners.push((id, listener));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = self.state();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// Update the state and notify listeners
    ///
    /// Returns `false` (and notifies nobody) when `(status, message)` equals
    /// the current pair.
    pub fn set(&self, status: ConnectionStatus, message: Option<String>) -> bool {
        let (snapshot, listeners) = {
            let mut state = self.state();
            let next = StatusSnapshot { status, message };
            if state.current == next {
                return false;
            }
            state.current = next.clone();
            let listeners: Vec<StatusListener> =
                state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (next, listeners)
        };

        tracing::debug!(status = %snapshot.status, message = ?snapshot.message, "Connection status changed");

        // Listeners run outside the lock so they may call back into us
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::error!(status = %snapshot.status, "Status listener panicked");
            }
        }
        true
    }
}
