//! In-process radio for host testing.
//!
//! `SimulatedRadio` models a set of virtual peripherals in range. Every
//! operation succeeds by default; failures are scripted per operation with
//! [`SimulatedRadio::fail_next`] and consumed in order. Latency can be set
//! per operation to exercise timeouts (use tokio's paused clock in tests).
//!
//! Peripherals added with [`SimulatedRadio::advertise_at`] are reported from a
//! spawned task at a fixed offset into each scan, for as long as that scan is
//! still running.

use super::{DiscoverySink, Radio, RadioError, ScanFilter};
use crate::registry::Observation;
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Radio operations, used to script failures and latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EnableAdapter,
    StartScan,
    StopScan,
    Disconnect,
    Connect,
    DiscoverServices,
    ReadSignalStrength,
    WriteCommand,
}

/// A write accepted by the simulated radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Target peripheral.
    pub id: String,
    /// Target service.
    pub service: Uuid,
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Chunks in the order they were written.
    pub chunks: Vec<Vec<u8>>,
}

impl WriteRecord {
    /// The chunks joined back into the full payload.
    pub fn payload(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

#[derive(Debug, Default)]
struct SimState {
    peripherals: Vec<Observation>,
    delayed: Vec<(Duration, Observation)>,
    failures: HashMap<Operation, VecDeque<RadioError>>,
    latency: HashMap<Operation, Duration>,
    calls: Vec<Operation>,
    writes: Vec<WriteRecord>,
    connected: Option<String>,
    scanning: bool,
    /// Bumped on every scan start; delayed reports belong to one scan.
    scan_generation: u64,
}

fn lock_state(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    // A panicking test thread must not wedge the other tasks
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scriptable in-memory radio.
#[derive(Debug, Default)]
pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRadio {
    /// Create a radio with no peripherals in range.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a radio with the given peripherals in range.
    ///
    /// They are advertised in order at the start of every scan.
    pub fn with_peripherals(peripherals: impl IntoIterator<Item = Observation>) -> Self {
        let radio = Self::new();
        radio.lock().peripherals = peripherals.into_iter().collect();
        radio
    }

    /// Bring a peripheral into range (or update its RSSI).
    pub fn add_peripheral(&self, observation: Observation) {
        let mut state = self.lock();
        match state.peripherals.iter_mut().find(|p| p.id == observation.id) {
            Some(existing) => *existing = observation,
            None => state.peripherals.push(observation),
        }
    }

    /// Bring a peripheral into range that is first heard `offset` after each
    /// scan starts. Reports stop once that scan is stopped or replaced.
    pub fn advertise_at(&self, offset: Duration, observation: Observation) {
        self.lock().delayed.push((offset, observation));
    }

    /// Take a peripheral out of range. Drops its connection if any.
    pub fn remove_peripheral(&self, id: &str) {
        let mut state = self.lock();
        state.peripherals.retain(|p| p.id != id);
        state.delayed.retain(|(_, p)| p.id != id);
        if state.connected.as_deref() == Some(id) {
            state.connected = None;
        }
    }

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: Operation, error: RadioError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Delay every call of `op` by `latency` before it completes.
    pub fn set_latency(&self, op: Operation, latency: Duration) {
        self.lock().latency.insert(op, latency);
    }

    /// Every operation called so far, in order.
    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    /// How many times `op` has been called.
    pub fn call_count(&self, op: Operation) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// The currently connected peripheral.
    pub fn connected(&self) -> Option<String> {
        self.lock().connected.clone()
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock_state(&self.state)
    }

    /// Record the call, wait its latency, then pop a scripted failure.
    async fn begin(&self, op: Operation) -> Result<(), RadioError> {
        let latency = {
            let mut state = self.lock();
            state.calls.push(op);
            state.latency.get(&op).copied().unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => {
                debug!("[radio] Simulated {:?} failure: {}", op, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn require_in_range(&self, id: &str) -> Result<Observation, RadioError> {
        let state = self.lock();
        state
            .peripherals
            .iter()
            .chain(state.delayed.iter().map(|(_, p)| p))
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| RadioError::PeripheralNotFound(id.to_string()))
    }

    fn require_connected(&self, id: &str) -> Result<(), RadioError> {
        if self.lock().connected.as_deref() == Some(id) {
            Ok(())
        } else {
            Err(RadioError::NotConnected(id.to_string()))
        }
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    async fn enable_adapter(&self) -> Result<(), RadioError> {
        self.begin(Operation::EnableAdapter).await
    }

    async fn start_scan(&self, filter: &ScanFilter, sink: DiscoverySink) -> Result<(), RadioError> {
        self.begin(Operation::StartScan).await?;
        let (peripherals, mut delayed, generation) = {
            let mut state = self.lock();
            state.scanning = true;
            state.scan_generation += 1;
            (state.peripherals.clone(), state.delayed.clone(), state.scan_generation)
        };
        debug!(
            "[radio] Simulated scan for {} ({} ms), {} in range, {} delayed",
            filter.service,
            filter.duration.as_millis(),
            peripherals.len(),
            delayed.len()
        );
        for peripheral in peripherals {
            if !sink.report(peripheral) {
                return Ok(());
            }
        }

        if !delayed.is_empty() {
            delayed.sort_by_key(|(offset, _)| *offset);
            let state = self.state.clone();
            let started = tokio::time::Instant::now();
            tokio::spawn(async move {
                for (offset, peripheral) in delayed {
                    tokio::time::sleep_until(started + offset).await;
                    let live = {
                        let state = lock_state(&state);
                        state.scanning && state.scan_generation == generation
                    };
                    if !live || !sink.report(peripheral) {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.begin(Operation::StopScan).await?;
        self.lock().scanning = false;
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), RadioError> {
        self.begin(Operation::Disconnect).await?;
        let mut state = self.lock();
        if state.connected.as_deref() == Some(id) {
            state.connected = None;
            Ok(())
        } else {
            Err(RadioError::NotConnected(id.to_string()))
        }
    }

    async fn connect(&self, id: &str) -> Result<(), RadioError> {
        self.begin(Operation::Connect).await?;
        self.require_in_range(id)?;
        self.lock().connected = Some(id.to_string());
        Ok(())
    }

    async fn discover_services(&self, id: &str) -> Result<(), RadioError> {
        self.begin(Operation::DiscoverServices).await?;
        self.require_connected(id)
    }

    async fn read_signal_strength(&self, id: &str) -> Result<i16, RadioError> {
        self.begin(Operation::ReadSignalStrength).await?;
        self.require_connected(id)?;
        Ok(self.require_in_range(id)?.rssi)
    }

    async fn write_command(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        max_len: usize,
    ) -> Result<(), RadioError> {
        self.begin(Operation::WriteCommand).await?;
        self.require_connected(id)?;
        let chunks = payload.chunks(max_len.max(1)).map(<[u8]>::to_vec).collect();
        self.lock().writes.push(WriteRecord {
            id: id.to_string(),
            service,
            characteristic,
            chunks,
        });
        Ok(())
    }
}
