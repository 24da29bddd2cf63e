//! Update hub
//!
//! The single consumer installed in every device's update slot. It keeps the
//! latest signal per `Device::address`, calls registered observers in order
//! and republishes on a broadcast feed for async listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::core::iec61850::reference::device_address;
use crate::core::model::signal::{Quality, Signal};
use crate::core::model::update::UpdateCallback;

/// One propagated read result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalUpdate {
    pub device: String,
    pub signal: Signal,
}

impl SignalUpdate {
    /// `Device::address`
    pub fn key(&self) -> String {
        device_address(&self.device, &self.signal.address)
    }
}

pub type Observer = Arc<dyn Fn(&SignalUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct UpdateHub {
    observers: RwLock<Vec<(ObserverId, Observer)>>,
    latest: DashMap<String, SignalUpdate>,
    feed: broadcast::Sender<SignalUpdate>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for UpdateHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHub")
            .field("observers", &self.observers.read().len())
            .field("latest", &self.latest.len())
            .finish()
    }
}

impl UpdateHub {
    pub fn new(feed_capacity: usize) -> Arc<Self> {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Arc::new(Self {
            observers: RwLock::new(Vec::new()),
            latest: DashMap::new(),
            feed,
            next_id: AtomicU64::new(1),
        })
    }

    /// Callback to install in a device's update slot
    pub fn callback(self: &Arc<Self>) -> UpdateCallback {
        let hub = Arc::clone(self);
        Arc::new(move |device: &str, signal: &Signal| hub.publish(device, signal))
    }

    pub fn subscribe(&self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Live feed; slow receivers lag rather than block publishers
    pub fn feed(&self) -> broadcast::Receiver<SignalUpdate> {
        self.feed.subscribe()
    }

    pub fn publish(&self, device: &str, signal: &Signal) {
        let update = SignalUpdate {
            device: device.to_string(),
            signal: signal.clone(),
        };
        trace!(key = %update.key(), quality = %signal.quality, "Signal update");
        self.latest.insert(update.key(), update.clone());
        self.dispatch(&update);
    }

    fn dispatch(&self, update: &SignalUpdate) {
        let observers: Vec<Observer> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer(update);
        }
        // No receivers is fine
        let _ = self.feed.send(update.clone());
    }

    pub fn latest(&self, key: &str) -> Option<SignalUpdate> {
        self.latest.get(key).map(|e| e.value().clone())
    }

    /// Latest updates for one device, ordered by address
    pub fn snapshot(&self, device: &str) -> Vec<SignalUpdate> {
        let mut updates: Vec<SignalUpdate> = self
            .latest
            .iter()
            .filter(|e| e.value().device == device)
            .map(|e| e.value().clone())
            .collect();
        updates.sort_by(|a, b| a.signal.address.cmp(&b.signal.address));
        updates
    }

    /// Downgrade a disconnected device's live values and notify observers
    pub fn mark_device_stale(&self, device: &str) -> usize {
        let mut changed = Vec::new();
        for mut entry in self.latest.iter_mut() {
            let update = entry.value_mut();
            if update.device == device && update.signal.quality == Quality::Good {
                update.signal.mark_stale();
                changed.push(update.clone());
            }
        }
        for update in &changed {
            self.dispatch(update);
        }
        debug!(device = %device, count = changed.len(), "Signals marked stale");
        changed.len()
    }

    /// Forget everything cached for a device
    pub fn forget_device(&self, device: &str) {
        self.latest.retain(|_, u| u.device != device);
    }
}
