//! Protocol-boundary update callback
//!
//! Each device holds exactly one slot. Every completed read, successful or
//! not, goes through [`UpdateSlot::emit`] once; fan-out to further observers
//! belongs to whoever installed the callback.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::signal::Signal;

/// Callback receiving `(device, signal)` after every read
pub type UpdateCallback = Arc<dyn Fn(&str, &Signal) + Send + Sync>;

#[derive(Clone, Default)]
pub struct UpdateSlot {
    callback: Arc<RwLock<Option<UpdateCallback>>>,
}

impl std::fmt::Debug for UpdateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSlot")
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl UpdateSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the consumer; a second install replaces the first
    pub fn install(&self, callback: UpdateCallback) {
        let mut slot = self.callback.write();
        if slot.is_some() {
            debug!("Replacing installed update callback");
        }
        *slot = Some(callback);
    }

    pub fn clear(&self) {
        *self.callback.write() = None;
    }

    pub fn is_installed(&self) -> bool {
        self.callback.read().is_some()
    }

    pub fn emit(&self, device: &str, signal: &Signal) {
        // Clone out so the callback never runs under the lock
        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            cb(device, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::iec61850::client::{Fc, MmsType};
    use crate::core::model::signal::{SignalKind, SignalType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_single_consumer() {
        let slot = UpdateSlot::new();
        let signal = Signal::new(
            "LD0/GGIO1.Ind1.stVal",
            "stVal",
            SignalKind::Binary,
            SignalType::Iec61850 {
                mms_type: MmsType::Boolean,
                fc: Fc::St,
            },
        );
        slot.emit("IED1", &signal);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        slot.install(Arc::new(move |device, s| {
            assert_eq!(device, "IED1");
            assert_eq!(s.name, "stVal");
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        slot.emit("IED1", &signal);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        slot.clear();
        slot.emit("IED1", &signal);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
