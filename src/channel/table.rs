//! Per-channel device table

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::Device;

struct Entry {
    device: Arc<dyn Device>,
    last_seen: Instant,
}

/// Devices discovered on one channel, keyed by `dev_id`.
///
/// Re-discovery of a `dev_id` replaces the previous entry.
#[derive(Default)]
pub struct DeviceTable {
    entries: RwLock<HashMap<String, Entry>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a device. Returns true if the id was not known before.
    pub fn insert(&self, device: Arc<dyn Device>) -> bool {
        let dev_id = device.info().dev_id.clone();
        let entry = Entry {
            device,
            last_seen: Instant::now(),
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(dev_id, entry).is_none()
    }

    pub fn get(&self, dev_id: &str) -> Option<Arc<dyn Device>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(dev_id).map(|e| e.device.clone())
    }

    pub fn contains(&self, dev_id: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(dev_id)
    }

    /// All known device ids
    pub fn ids(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }

    /// All known devices
    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().map(|e| e.device.clone()).collect()
    }

    pub fn remove(&self, dev_id: &str) -> Option<Arc<dyn Device>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(dev_id).map(|e| e.device)
    }

    /// Drop devices not seen for at least `max_age`, returning their ids
    pub fn evict_older_than(&self, max_age: Duration) -> Vec<String> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.last_seen.elapsed() >= max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            entries.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
