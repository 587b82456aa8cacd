//! Session error taxonomy.
//!
//! None of these reach the caller of `process`; each is handled inside the
//! state it occurred in and drives a transition. They are surfaced through
//! transition records, logs and [`crate::stats::SessionStats`].

use crate::radio::RadioError;
use std::fmt;

/// Failure classes the session recovers from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The adapter could not be enabled.
    AdapterRefused(RadioError),
    /// A scan could not be started.
    ScanFailure(RadioError),
    /// The peripheral was unreachable or rejected the connection.
    ConnectFailure(RadioError),
    /// GATT service discovery failed.
    ServiceDiscoveryFailure(RadioError),
    /// The RSSI read after connecting failed.
    SignalReadFailure(RadioError),
    /// The local stack rejected a write.
    WriteFailure(RadioError),
    /// A scan window closed without any candidate.
    NoCandidate,
    /// Connecting or writing took longer than the operation timeout.
    Timeout,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterRefused(e) => write!(f, "adapter refused: {}", e),
            Self::ScanFailure(e) => write!(f, "scan failed: {}", e),
            Self::ConnectFailure(e) => write!(f, "connect failed: {}", e),
            Self::ServiceDiscoveryFailure(e) => write!(f, "service discovery failed: {}", e),
            Self::SignalReadFailure(e) => write!(f, "RSSI read failed: {}", e),
            Self::WriteFailure(e) => write!(f, "write failed: {}", e),
            Self::NoCandidate => write!(f, "no peripheral found"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AdapterRefused(e)
            | Self::ScanFailure(e)
            | Self::ConnectFailure(e)
            | Self::ServiceDiscoveryFailure(e)
            | Self::SignalReadFailure(e)
            | Self::WriteFailure(e) => Some(e),
            Self::NoCandidate | Self::Timeout => None,
        }
    }
}

/// The session task has stopped; requests can no longer be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed;

impl fmt::Display for SessionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session closed")
    }
}

impl std::error::Error for SessionClosed {}
