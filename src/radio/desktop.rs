//! Desktop BLE backend built on btleplug.
//!
//! Uses the first adapter reported by the platform manager. Scans are
//! filtered on the service UUID; the adapter event stream is forwarded to the
//! session's [`DiscoverySink`] until the window closes or the scan is stopped.
//!
//! btleplug identifies peripherals by a platform `PeripheralId`; the session
//! works with its string form, so peripherals seen while scanning are cached
//! under that key. The cache only holds the current window's peripherals.

use super::{DiscoverySink, Radio, RadioError, ScanFilter};
use crate::registry::Observation;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter as BtScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type PeripheralCache = Arc<Mutex<HashMap<String, Peripheral>>>;
type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// BLE radio backed by the host's Bluetooth stack.
pub struct BtleplugRadio {
    adapter: Adapter,
    peripherals: PeripheralCache,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter on this machine.
    pub async fn first_adapter() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::AdapterUnavailable("no Bluetooth adapter found".into()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("[radio] Using adapter: {}", info),
            Err(e) => warn!("[radio] Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_cancel: Mutex::new(None),
        })
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral, RadioError> {
        if let Some(p) = lock(&self.peripherals).get(id) {
            return Ok(p.clone());
        }
        // Not seen in a scan of ours; the platform may still know it
        let found = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| RadioError::PeripheralNotFound(id.to_string()))?;
        lock(&self.peripherals).insert(id.to_string(), found.clone());
        Ok(found)
    }

    fn replace_scan_token(&self, token: Option<CancellationToken>) {
        let previous = {
            let mut slot = match self.scan_cancel.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *slot, token)
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

fn lock(cache: &PeripheralCache) -> std::sync::MutexGuard<'_, HashMap<String, Peripheral>> {
    match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Forward adapter events to the sink until cancelled or the window closes.
async fn forward_discoveries(
    adapter: Adapter,
    mut events: EventStream,
    cache: PeripheralCache,
    filter: ScanFilter,
    sink: DiscoverySink,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::sleep(filter.duration);
    tokio::pin!(deadline);
    let mut seen = HashSet::new();

    loop {
        let id = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut deadline => break,
            event = events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => id,
                Some(_) => continue,
                None => break,
            },
        };

        if !filter.allow_duplicates && !seen.insert(id.clone()) {
            continue;
        }
        let Ok(peripheral) = adapter.peripheral(&id).await else {
            continue;
        };
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            _ => continue,
        };
        let Some(rssi) = props.rssi else {
            continue;
        };

        let key = peripheral.id().to_string();
        lock(&cache).insert(key.clone(), peripheral);
        if !sink.report(Observation::new(key, props.local_name.unwrap_or_default(), rssi)) {
            break;
        }
    }
    debug!("[radio] Discovery forwarding ended");
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn enable_adapter(&self) -> Result<(), RadioError> {
        // btleplug cannot power the adapter on; a responsive adapter counts as enabled
        self.adapter
            .adapter_info()
            .await
            .map(|_| ())
            .map_err(|e| RadioError::AdapterUnavailable(e.to_string()))
    }

    async fn start_scan(&self, filter: &ScanFilter, sink: DiscoverySink) -> Result<(), RadioError> {
        lock(&self.peripherals).clear();
        // Subscribe first so nothing advertised during start-up is missed
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(BtScanFilter {
                services: vec![filter.service],
            })
            .await?;

        let cancel = CancellationToken::new();
        self.replace_scan_token(Some(cancel.clone()));
        tokio::spawn(forward_discoveries(
            self.adapter.clone(),
            events,
            self.peripherals.clone(),
            *filter,
            sink,
            cancel,
        ));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.replace_scan_token(None);
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), RadioError> {
        self.peripheral(id).await?.disconnect().await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), RadioError> {
        self.peripheral(id).await?.connect().await?;
        Ok(())
    }

    async fn discover_services(&self, id: &str) -> Result<(), RadioError> {
        self.peripheral(id).await?.discover_services().await?;
        Ok(())
    }

    async fn read_signal_strength(&self, id: &str) -> Result<i16, RadioError> {
        self.peripheral(id)
            .await?
            .properties()
            .await?
            .and_then(|props| props.rssi)
            .ok_or_else(|| RadioError::Backend(format!("no RSSI reported for {}", id)))
    }

    async fn write_command(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        max_len: usize,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(id).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(RadioError::CharacteristicNotFound(characteristic))?;

        for chunk in payload.chunks(max_len.max(1)) {
            peripheral
                .write(&target, chunk, WriteType::WithoutResponse)
                .await?;
        }
        Ok(())
    }
}

impl From<btleplug::Error> for RadioError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => {
                Self::AdapterUnavailable("permission denied".into())
            }
            btleplug::Error::DeviceNotFound => Self::PeripheralNotFound("unknown".into()),
            btleplug::Error::NotConnected => Self::NotConnected("peripheral".into()),
            btleplug::Error::TimedOut(_) => Self::Timeout,
            other => Self::Backend(other.to_string()),
        }
    }
}
