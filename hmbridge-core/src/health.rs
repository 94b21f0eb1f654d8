//! Per-remote health tracking.
//!
//! Every outbound call made through a [`LockingProxy`](crate::LockingProxy)
//! is recorded here. Faults count as answers (the controller is reachable);
//! only transport failures and timeouts count against the remote.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Consecutive failures after which a remote is considered offline.
pub const OFFLINE_THRESHOLD: u32 = 3;

/// Remote availability status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    /// Remote is answering calls.
    Online,
    /// Remote stopped answering.
    Offline,
    /// Remote failed recently but not often enough to be offline.
    Degraded,
    /// No call has been made yet.
    #[default]
    Unknown,
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStatus::Online => write!(f, "online"),
            RemoteStatus::Offline => write!(f, "offline"),
            RemoteStatus::Degraded => write!(f, "degraded"),
            RemoteStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    status: RemoteStatus,
    /// Last successful call (millis since epoch).
    last_success: Option<i64>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Health of a single remote.
#[derive(Debug)]
pub struct RemoteHealth {
    remote: String,
    calls: AtomicU64,
    failures: AtomicU64,
    state: Mutex<HealthState>,
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
    pub remote: String,
    pub status: RemoteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub calls: u64,
    pub failures: u64,
}

impl RemoteHealth {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            state: Mutex::new(HealthState::default()),
        }
    }

    /// Record an answered call.
    pub fn record_success(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        state.status = RemoteStatus::Online;
        state.last_success = Some(chrono::Utc::now().timestamp_millis());
        state.consecutive_failures = 0;
        state.last_error = None;
    }

    /// Record a call that never got an answer.
    pub fn record_failure(&self, error: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_error = Some(error.to_string());

        if state.consecutive_failures >= OFFLINE_THRESHOLD {
            state.status = RemoteStatus::Offline;
        } else {
            state.status = RemoteStatus::Degraded;
        }
    }

    pub fn status(&self) -> RemoteStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock();
        HealthSnapshot {
            remote: self.remote.clone(),
            status: state.status,
            last_success: state.last_success,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            calls: self.calls.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}
