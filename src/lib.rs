//! BLE link controller library.
//!
//! Keeps a command channel open to the strongest nearby BLE peripheral that
//! advertises a given service: scan, pick the best candidate, connect, write
//! commands, and recover from every failure by rescanning.
//!
//! All components are host-testable; [`radio::SimulatedRadio`] stands in for
//! a real adapter.

pub mod config;
pub mod console;
pub mod radio;
pub mod registry;
pub mod session;
pub mod stats;

// Re-export commonly used items
pub use config::{ConfigError, SessionConfig};
pub use radio::{Radio, RadioError, SimulatedRadio};
pub use registry::{Observation, PeripheralRecord, PeripheralRegistry};
pub use session::{Request, Session, SessionClosed, SessionError, SessionHandle, SessionState, Transition};
pub use stats::{SessionStats, StatsServer, DEFAULT_STATS_PORT};

#[cfg(feature = "host-ble")]
pub use radio::BtleplugRadio;
