//! Session statistics.
//!
//! Shared between the session task (writer) and the stats server or any
//! other reader. All fields are atomics, so reads never lock.
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 120,
//!   "state": "idle",
//!   "active": true,
//!   "degraded": false,
//!   "consecutive_failures": 0,
//!   "link": { "scans": 3, "connect_attempts": 2, "connections": 1, "writes": 7, "queued": 0 },
//!   "failures": {
//!     "adapter_refused": 0, "scan": 0, "connect": 1, "service_discovery": 0,
//!     "signal_read": 0, "write": 0, "no_candidate": 1, "timeout": 0
//!   },
//!   "stale_completions": 1
//! }
//! ```

mod server;

pub use server::{StatsServer, DEFAULT_STATS_PORT};

use crate::session::{SessionError, SessionState};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

/// Progress counters for the link.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Scan windows started.
    pub scans: AtomicUsize,
    /// Connect sequences started.
    pub connect_attempts: AtomicUsize,
    /// Connect sequences that reached `Idle`.
    pub connections: AtomicUsize,
    /// Requests accepted by the radio.
    pub writes: AtomicUsize,
    /// Requests currently waiting (including the one in flight).
    pub queued: AtomicUsize,
}

impl LinkStats {
    fn to_json(&self) -> String {
        format!(
            r#"{{"scans":{},"connect_attempts":{},"connections":{},"writes":{},"queued":{}}}"#,
            self.scans.load(Ordering::Relaxed),
            self.connect_attempts.load(Ordering::Relaxed),
            self.connections.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
            self.queued.load(Ordering::Relaxed)
        )
    }
}

/// Failure counts, one per [`SessionError`] class.
#[derive(Debug, Default)]
pub struct FailureStats {
    pub adapter_refused: AtomicUsize,
    pub scan: AtomicUsize,
    pub connect: AtomicUsize,
    pub service_discovery: AtomicUsize,
    pub signal_read: AtomicUsize,
    pub write: AtomicUsize,
    pub no_candidate: AtomicUsize,
    pub timeout: AtomicUsize,
}

impl FailureStats {
    fn counter(&self, error: &SessionError) -> &AtomicUsize {
        match error {
            SessionError::AdapterRefused(_) => &self.adapter_refused,
            SessionError::ScanFailure(_) => &self.scan,
            SessionError::ConnectFailure(_) => &self.connect,
            SessionError::ServiceDiscoveryFailure(_) => &self.service_discovery,
            SessionError::SignalReadFailure(_) => &self.signal_read,
            SessionError::WriteFailure(_) => &self.write,
            SessionError::NoCandidate => &self.no_candidate,
            SessionError::Timeout => &self.timeout,
        }
    }

    /// Sum over all classes.
    pub fn total(&self) -> usize {
        [
            &self.adapter_refused,
            &self.scan,
            &self.connect,
            &self.service_discovery,
            &self.signal_read,
            &self.write,
            &self.no_candidate,
            &self.timeout,
        ]
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .sum()
    }

    fn to_json(&self) -> String {
        format!(
            r#"{{"adapter_refused":{},"scan":{},"connect":{},"service_discovery":{},"signal_read":{},"write":{},"no_candidate":{},"timeout":{}}}"#,
            self.adapter_refused.load(Ordering::Relaxed),
            self.scan.load(Ordering::Relaxed),
            self.connect.load(Ordering::Relaxed),
            self.service_discovery.load(Ordering::Relaxed),
            self.signal_read.load(Ordering::Relaxed),
            self.write.load(Ordering::Relaxed),
            self.no_candidate.load(Ordering::Relaxed),
            self.timeout.load(Ordering::Relaxed)
        )
    }
}

/// Session statistics container.
///
/// The session flags itself degraded after `degraded_after` consecutive
/// failures without reaching `Idle`. Degradation is informational only and
/// never changes how the session behaves.
#[derive(Debug)]
pub struct SessionStats {
    start_time: Instant,
    degraded_after: u32,
    state: AtomicU8,
    active: AtomicBool,
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    stale_completions: AtomicUsize,
    /// Progress counters.
    pub link: LinkStats,
    /// Failure counters.
    pub failures: FailureStats,
}

impl SessionStats {
    /// Create statistics that flag degradation after `degraded_after` failures in a row.
    pub fn new(degraded_after: u32) -> Self {
        Self {
            start_time: Instant::now(),
            degraded_after,
            state: AtomicU8::new(SessionState::Scanning.to_u8()),
            active: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            stale_completions: AtomicUsize::new(0),
            link: LinkStats::default(),
            failures: FailureStats::default(),
        }
    }

    /// Seconds since the statistics were created.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Last state the session entered.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Relaxed)).unwrap_or(SessionState::Scanning)
    }

    /// Last published activity flag.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Whether consecutive failures have reached the threshold.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Failures since `Idle` was last reached.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Completions dropped because their operation was superseded.
    pub fn stale_completions(&self) -> usize {
        self.stale_completions.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state.to_u8(), Ordering::Relaxed);
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &SessionError) {
        self.failures.counter(error).fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= self.degraded_after && !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                "[session] Link degraded after {} consecutive failures (last: {})",
                consecutive, error
            );
        }
    }

    /// `Idle` reached: the failure streak ends.
    pub(crate) fn record_connected(&self) {
        self.link.connections.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("[session] Link recovered");
        }
    }

    pub(crate) fn record_stale(&self) {
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Serialize all statistics to JSON.
    pub fn to_json(&self) -> String {
        format!(
            r#"{{"uptime_secs":{},"state":"{}","active":{},"degraded":{},"consecutive_failures":{},"link":{},"failures":{},"stale_completions":{}}}"#,
            self.uptime_secs(),
            self.state(),
            self.is_active(),
            self.is_degraded(),
            self.consecutive_failures(),
            self.link.to_json(),
            self.failures.to_json(),
            self.stale_completions()
        )
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new(crate::config::SessionConfig::default().degraded_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RadioError;

    #[test]
    fn test_new_stats_are_zero() {
        let stats = SessionStats::new(3);
        assert_eq!(stats.state(), SessionState::Scanning);
        assert!(!stats.is_active());
        assert!(!stats.is_degraded());
        assert_eq!(stats.failures.total(), 0);
        assert_eq!(stats.link.writes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_failures_counted_per_class() {
        let stats = SessionStats::new(10);
        stats.record_failure(&SessionError::ConnectFailure(RadioError::Timeout));
        stats.record_failure(&SessionError::ConnectFailure(RadioError::Timeout));
        stats.record_failure(&SessionError::NoCandidate);

        assert_eq!(stats.failures.connect.load(Ordering::Relaxed), 2);
        assert_eq!(stats.failures.no_candidate.load(Ordering::Relaxed), 1);
        assert_eq!(stats.failures.total(), 3);
        assert_eq!(stats.consecutive_failures(), 3);
    }

    #[test]
    fn test_degraded_after_threshold_and_cleared_by_connection() {
        let stats = SessionStats::new(2);
        stats.record_failure(&SessionError::Timeout);
        assert!(!stats.is_degraded());
        stats.record_failure(&SessionError::Timeout);
        assert!(stats.is_degraded());

        stats.record_connected();
        assert!(!stats.is_degraded());
        assert_eq!(stats.consecutive_failures(), 0);
        assert_eq!(stats.link.connections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_json() {
        let stats = SessionStats::new(5);
        stats.set_state(SessionState::Idle);
        stats.set_active(true);
        stats.link.writes.store(4, Ordering::Relaxed);
        stats.record_stale();

        let json = stats.to_json();
        assert!(json.contains("\"state\":\"idle\""));
        assert!(json.contains("\"active\":true"));
        assert!(json.contains("\"writes\":4"));
        assert!(json.contains("\"stale_completions\":1"));

        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["failures"]["timeout"], 0);
        assert_eq!(parsed["degraded"], false);
    }
}
