//! Best-candidate selection for one scan window.
//!
//! Every advertisement seen during a scan window is folded into a single
//! [`PeripheralRecord`]: an observation replaces the stored record only when
//! its signal strength is strictly greater. Ties therefore keep the first
//! peripheral seen. No list of observations is kept, so memory stays bounded
//! however long the session keeps rescanning.
//!
//! # Example
//!
//! ```
//! use ble_link::registry::{Observation, PeripheralRegistry};
//! use ble_link::config::{DEFAULT_CHARACTERISTIC_ID, DEFAULT_SERVICE_ID};
//!
//! let mut registry = PeripheralRegistry::new(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID);
//! registry.consider_candidate(&Observation::new("aa:01", "A", -80));
//! registry.consider_candidate(&Observation::new("aa:02", "B", -60));
//! registry.consider_candidate(&Observation::new("aa:03", "C", -70));
//!
//! assert_eq!(registry.current_best().unwrap().name, "B");
//! ```

use log::debug;
use uuid::Uuid;

/// Signal strength of an empty record. Nothing weaker can ever replace it.
pub const WEAKEST_SIGNAL: i16 = -128;

/// One advertisement as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Opaque connection handle.
    pub id: String,
    /// Advertised local name (may be empty).
    pub name: String,
    /// RSSI in dBm.
    pub rssi: i16,
}

impl Observation {
    /// Create a new observation.
    pub fn new(id: impl Into<String>, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
        }
    }
}

/// Best peripheral found so far in the current scan window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRecord {
    /// Advertised name (may be empty).
    pub name: String,
    /// Strongest RSSI seen, or the last value read after connecting.
    pub signal_strength: i16,
    /// Opaque connection handle.
    pub id: String,
    /// Service the command characteristic lives on.
    pub service_id: Uuid,
    /// Characteristic commands are written to.
    pub characteristic_id: Uuid,
}

impl PeripheralRecord {
    /// Create an empty record at the weakest signal strength.
    pub fn empty(service_id: Uuid, characteristic_id: Uuid) -> Self {
        Self {
            name: String::new(),
            signal_strength: WEAKEST_SIGNAL,
            id: String::new(),
            service_id,
            characteristic_id,
        }
    }

    /// Whether an observation has been folded into this record.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

/// Folds scan observations into the single strongest candidate.
///
/// Not synchronized; the session only touches it from its own task.
#[derive(Debug, Clone)]
pub struct PeripheralRegistry {
    record: PeripheralRecord,
}

impl PeripheralRegistry {
    /// Create an empty registry for the given service and characteristic.
    pub fn new(service_id: Uuid, characteristic_id: Uuid) -> Self {
        Self {
            record: PeripheralRecord::empty(service_id, characteristic_id),
        }
    }

    /// Replace the stored record if `observed` is strictly stronger.
    ///
    /// Returns `true` if the record was replaced.
    pub fn consider_candidate(&mut self, observed: &Observation) -> bool {
        if observed.rssi <= self.record.signal_strength {
            return false;
        }
        debug!(
            "[registry] New best candidate: {:?} rssi: {} id: {}",
            observed.name, observed.rssi, observed.id
        );
        self.record.name.clone_from(&observed.name);
        self.record.id.clone_from(&observed.id);
        self.record.signal_strength = observed.rssi;
        true
    }

    /// The strongest peripheral seen, or `None` if nothing beat the baseline.
    pub fn current_best(&self) -> Option<&PeripheralRecord> {
        (!self.record.is_empty()).then_some(&self.record)
    }

    /// Forget the stored record before a new scan window.
    pub fn reset(&mut self) {
        self.record = PeripheralRecord::empty(self.record.service_id, self.record.characteristic_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_CHARACTERISTIC_ID, DEFAULT_SERVICE_ID};

    fn registry() -> PeripheralRegistry {
        PeripheralRegistry::new(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
    }

    #[test]
    fn test_empty_registry_has_no_candidate() {
        let registry = registry();
        assert!(registry.current_best().is_none());
    }

    #[test]
    fn test_strongest_wins() {
        let mut registry = registry();
        registry.consider_candidate(&Observation::new("a", "A", -80));
        registry.consider_candidate(&Observation::new("b", "B", -60));
        registry.consider_candidate(&Observation::new("c", "C", -70));

        let best = registry.current_best().unwrap();
        assert_eq!(best.id, "b");
        assert_eq!(best.name, "B");
        assert_eq!(best.signal_strength, -60);
        assert_eq!(best.service_id, DEFAULT_SERVICE_ID);
        assert_eq!(best.characteristic_id, DEFAULT_CHARACTERISTIC_ID);
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let mut registry = registry();
        assert!(registry.consider_candidate(&Observation::new("first", "", -65)));
        assert!(!registry.consider_candidate(&Observation::new("second", "", -65)));
        assert_eq!(registry.current_best().unwrap().id, "first");
    }

    #[test]
    fn test_weakest_signal_never_replaces_baseline() {
        let mut registry = registry();
        assert!(!registry.consider_candidate(&Observation::new("x", "X", WEAKEST_SIGNAL)));
        assert!(registry.current_best().is_none());
    }

    #[test]
    fn test_fold_matches_maximum() {
        let readings = [-91, -40, -77, -40, -55, -102, -41];
        let mut registry = registry();
        for (i, rssi) in readings.iter().enumerate() {
            registry.consider_candidate(&Observation::new(format!("p{}", i), "", *rssi));
        }
        let best = registry.current_best().unwrap();
        assert_eq!(best.signal_strength, -40);
        // First of the two -40 readings
        assert_eq!(best.id, "p1");
    }

    #[test]
    fn test_duplicate_advertisements_update_in_place() {
        let mut registry = registry();
        registry.consider_candidate(&Observation::new("a", "A", -80));
        registry.consider_candidate(&Observation::new("a", "A", -72));
        let best = registry.current_best().unwrap();
        assert_eq!(best.id, "a");
        assert_eq!(best.signal_strength, -72);
    }

    #[test]
    fn test_reset_clears_record() {
        let mut registry = registry();
        registry.consider_candidate(&Observation::new("a", "A", -50));
        registry.reset();
        assert!(registry.current_best().is_none());

        // A weaker peripheral can win the next window
        registry.consider_candidate(&Observation::new("b", "B", -90));
        assert_eq!(registry.current_best().unwrap().id, "b");
    }
}
