//! Radio capability set consumed by the session.
//!
//! The session never talks to a BLE stack directly. Everything it needs is
//! behind the [`Radio`] trait: adapter control, scanning, connect/disconnect,
//! service discovery, RSSI reads and command writes. Each operation is a
//! single-shot async call that either completes or fails.
//!
//! # Backends
//!
//! - [`SimulatedRadio`] - in-process radio with scripted failures (host tests,
//!   `link-controller --simulate`)
//! - [`BtleplugRadio`] - desktop BLE via btleplug (`host-ble` feature)

mod sim;

#[cfg(feature = "host-ble")]
mod desktop;

pub use sim::{Operation, SimulatedRadio, WriteRecord};

#[cfg(feature = "host-ble")]
pub use desktop::BtleplugRadio;

use crate::registry::Observation;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Parameters for one bounded scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only peripherals advertising this service are reported.
    pub service: Uuid,
    /// Length of the scan window.
    pub duration: Duration,
    /// Report repeated advertisements from the same peripheral.
    pub allow_duplicates: bool,
}

/// Destination for discovery events raised during a scan window.
///
/// The radio calls [`DiscoverySink::report`] once per advertisement seen.
/// Reporting never blocks; a `false` return means the session is gone and
/// the radio may stop forwarding.
#[derive(Clone)]
pub struct DiscoverySink {
    forward: Arc<dyn Fn(Observation) -> bool + Send + Sync>,
}

impl DiscoverySink {
    /// Create a sink from a forwarding function.
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(Observation) -> bool + Send + Sync + 'static,
    {
        Self {
            forward: Arc::new(forward),
        }
    }

    /// Forward one observation. Returns `false` if nobody is listening any more.
    pub fn report(&self, observation: Observation) -> bool {
        (self.forward)(observation)
    }
}

impl fmt::Debug for DiscoverySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySink").finish_non_exhaustive()
    }
}

/// Asynchronous radio operations.
///
/// Implementations must be usable from spawned tasks, hence `Send + Sync`.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Make sure the adapter is powered. Fails if the user or system refuses.
    async fn enable_adapter(&self) -> Result<(), RadioError>;

    /// Start a bounded scan. Returns once the scan is running; discoveries
    /// are pushed to `sink` until the window closes or [`Radio::stop_scan`].
    async fn start_scan(&self, filter: &ScanFilter, sink: DiscoverySink) -> Result<(), RadioError>;

    /// Stop a running scan.
    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Drop any existing connection to the peripheral.
    async fn disconnect(&self, id: &str) -> Result<(), RadioError>;

    /// Connect to the peripheral.
    async fn connect(&self, id: &str) -> Result<(), RadioError>;

    /// Discover GATT services on a connected peripheral.
    async fn discover_services(&self, id: &str) -> Result<(), RadioError>;

    /// Read the current RSSI of a connected peripheral.
    async fn read_signal_strength(&self, id: &str) -> Result<i16, RadioError>;

    /// Write `payload` without response, split into chunks of at most
    /// `max_len` bytes. Completes when the local stack accepted every chunk.
    async fn write_command(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        max_len: usize,
    ) -> Result<(), RadioError>;
}

/// Errors reported by a radio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Adapter missing, powered off, or enabling it was refused.
    AdapterUnavailable(String),
    /// No peripheral with this identifier is known.
    PeripheralNotFound(String),
    /// Operation needs a connection that does not exist.
    NotConnected(String),
    /// Peripheral does not expose the service.
    ServiceNotFound(Uuid),
    /// Service does not expose the characteristic.
    CharacteristicNotFound(Uuid),
    /// The operation did not complete in time.
    Timeout,
    /// Any other backend failure.
    Backend(String),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterUnavailable(msg) => write!(f, "adapter unavailable: {}", msg),
            Self::PeripheralNotFound(id) => write!(f, "peripheral not found: {}", id),
            Self::NotConnected(id) => write!(f, "not connected to {}", id),
            Self::ServiceNotFound(uuid) => write!(f, "service not found: {}", uuid),
            Self::CharacteristicNotFound(uuid) => write!(f, "characteristic not found: {}", uuid),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Backend(msg) => write!(f, "radio error: {}", msg),
        }
    }
}

impl std::error::Error for RadioError {}
