//! Session states and transition records.

use super::error::SessionError;
use std::fmt;

/// Lifecycle state of the device session. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Collecting advertisements for one scan window.
    Scanning,
    /// Connecting to the best candidate and discovering its services.
    Connecting,
    /// Waiting before a rescan after a scan could not be started.
    RescanWait,
    /// Connected; pending commands are written here.
    Idle,
    /// Waiting before a rescan after adapter refusal or a failed write.
    FailureWait,
}

impl SessionState {
    /// All states, in declaration order.
    pub const ALL: [SessionState; 5] = [
        Self::Scanning,
        Self::Connecting,
        Self::RescanWait,
        Self::Idle,
        Self::FailureWait,
    ];

    /// Short lowercase name, used in logs and the stats JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::RescanWait => "rescan_wait",
            Self::Idle => "idle",
            Self::FailureWait => "failure_wait",
        }
    }

    /// Whether this is one of the two backoff states.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::RescanWait | Self::FailureWait)
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the session changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    /// Session started.
    Start,
    /// Scan window closed with a candidate.
    WindowClosed,
    /// Connect, service discovery and RSSI read all succeeded.
    Connected,
    /// A backoff delay expired.
    BackoffElapsed,
    /// An operation failed.
    Failure(SessionError),
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::WindowClosed => write!(f, "scan window closed"),
            Self::Connected => write!(f, "connected"),
            Self::BackoffElapsed => write!(f, "backoff elapsed"),
            Self::Failure(e) => write!(f, "{}", e),
        }
    }
}

/// One state change, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub cause: Cause,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.from, self.to, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_round_trip_covers_all_states() {
        for state in SessionState::ALL {
            assert_eq!(SessionState::from_u8(state.to_u8()), Some(state));
        }
        assert_eq!(SessionState::from_u8(5), None);
    }

    #[test]
    fn test_waiting_states() {
        assert!(SessionState::RescanWait.is_waiting());
        assert!(SessionState::FailureWait.is_waiting());
        assert!(!SessionState::Idle.is_waiting());
    }

    #[test]
    fn test_transition_display() {
        let t = Transition {
            from: SessionState::Idle,
            to: SessionState::FailureWait,
            cause: Cause::Failure(SessionError::Timeout),
        };
        assert_eq!(t.to_string(), "idle -> failure_wait (operation timed out)");
    }
}
