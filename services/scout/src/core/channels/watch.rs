//! Watch list
//!
//! Nothing is read unless it is watched. Registrations are explicit, a
//! refresh is a one-off read of every watched signal, and interval polling
//! only runs after `start_polling` and stops on `stop_polling` or shutdown.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::DeviceManager;
use crate::core::iec61850::reference::{device_address, split_device_address};
use crate::error::{ErrorExt, Result, ScoutSrvError};

/// Shortest accepted polling interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub device: String,
    pub address: String,
}

impl WatchEntry {
    /// `device::address`
    pub fn id(&self) -> String {
        device_address(&self.device, &self.address)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatchFile {
    poll_interval_ms: u64,
    signals: Vec<WatchEntry>,
}

/// Outcome of one refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub requested: usize,
    pub updated: usize,
    /// Devices whose read request failed outright
    pub failed_devices: Vec<String>,
}

struct Poller {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WatchList {
    manager: Arc<DeviceManager>,
    entries: RwLock<BTreeMap<String, WatchEntry>>,
    poll_interval: RwLock<Duration>,
    poller: Mutex<Option<Poller>>,
}

impl std::fmt::Debug for WatchList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchList")
            .field("entries", &self.entries.read().len())
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl WatchList {
    pub fn new(manager: Arc<DeviceManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            entries: RwLock::new(BTreeMap::new()),
            poll_interval: RwLock::new(Duration::from_millis(1000)),
            poller: Mutex::new(None),
        })
    }

    /// Watch a `Device::path` signal; returns its watch id
    pub fn add(&self, address: &str) -> Result<String> {
        let (device, path) = split_device_address(address).ok_or_else(|| {
            ScoutSrvError::validation(format!("address '{address}' lacks a 'Device::' prefix"))
        })?;
        let entry = WatchEntry {
            device: device.to_string(),
            address: path.to_string(),
        };
        let id = entry.id();
        if self.entries.write().insert(id.clone(), entry).is_none() {
            debug!(watch_id = %id, "Watch added");
        }
        Ok(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        *self.poll_interval.read()
    }

    fn by_device(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.entries.read().values() {
            grouped
                .entry(entry.device.clone())
                .or_default()
                .push(entry.address.clone());
        }
        grouped
    }

    /// Read every watched signal once, one queued request per device
    ///
    /// Values reach observers through the update hub; the summary only
    /// counts them.
    pub async fn refresh(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        for (device, paths) in self.by_device() {
            summary.requested += paths.len();
            match self.manager.read_many(&device, paths).await {
                Ok(signals) => summary.updated += signals.len(),
                Err(e) => {
                    warn!(device = %device, "Watch refresh failed: {}", e);
                    summary.failed_devices.push(device);
                },
            }
        }
        debug!(
            requested = summary.requested,
            updated = summary.updated,
            "Watch refresh complete"
        );
        summary
    }

    /// Start interval polling, replacing any running poller
    ///
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let interval = if interval < MIN_POLL_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "Poll interval raised to {} ms",
                MIN_POLL_INTERVAL.as_millis()
            );
            MIN_POLL_INTERVAL
        } else {
            interval
        };
        *self.poll_interval.write() = interval;

        let token = CancellationToken::new();
        let child = token.clone();
        let list = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        list.refresh().await;
                    },
                }
            }
            debug!("Watch poller stopped");
        });

        if let Some(previous) = self.poller.lock().replace(Poller { token, task }) {
            previous.token.cancel();
        }
        info!(interval_ms = interval.as_millis() as u64, "Watch polling started");
    }

    /// Stop polling and wait for an in-flight refresh to finish
    pub async fn stop_polling(&self) {
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.token.cancel();
            if let Err(e) = poller.task.await {
                warn!("Watch poller ended abnormally: {}", e);
            }
            info!("Watch polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .is_some_and(|p| !p.task.is_finished())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = WatchFile {
            poll_interval_ms: self.poll_interval().as_millis() as u64,
            signals: self.entries.read().values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json).io_error(&format!("write {}", path.display()))?;
        info!(path = %path.display(), count = file.signals.len(), "Watch list saved");
        Ok(())
    }

    /// Replace the registrations with a saved list; returns how many loaded
    pub fn load(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path).io_error(&format!("read {}", path.display()))?;
        let file: WatchFile = serde_json::from_str(&text)?;

        let mut entries = self.entries.write();
        entries.clear();
        for entry in file.signals {
            entries.insert(entry.id(), entry);
        }
        *self.poll_interval.write() =
            Duration::from_millis(file.poll_interval_ms).max(MIN_POLL_INTERVAL);
        info!(path = %path.display(), count = entries.len(), "Watch list loaded");
        Ok(entries.len())
    }
}
