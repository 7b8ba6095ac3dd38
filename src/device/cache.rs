use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::tuya::DpsKey;

#[derive(Debug, Clone, PartialEq)]
pub struct DpsEntry {
    pub value: Value,
    /// Set when the value changed since it was last published.
    pub dirty: bool,
}

/// Last known value of every data point seen on one device.
#[derive(Debug, Default)]
pub struct StateCache {
    entries: BTreeMap<DpsKey, DpsEntry>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a pushed `dps` object. Keys whose value differs from the cached
    /// one (or that were unknown) are marked dirty and returned.
    pub fn update(&mut self, incoming: &Map<String, Value>) -> Vec<DpsKey> {
        let mut changed = Vec::new();
        for (raw_key, value) in incoming {
            let Ok(key) = raw_key.parse::<DpsKey>() else {
                debug!("Ignoring non-numeric DPS key {}", raw_key);
                continue;
            };
            match self.entries.get_mut(&key) {
                Some(entry) if entry.value == *value => {}
                Some(entry) => {
                    entry.value = value.clone();
                    entry.dirty = true;
                    changed.push(key);
                }
                None => {
                    self.entries.insert(
                        key,
                        DpsEntry {
                            value: value.clone(),
                            dirty: true,
                        },
                    );
                    changed.push(key);
                }
            }
        }
        changed
    }

    /// Store a queried value and mark it dirty whether or not it changed.
    pub fn store(&mut self, key: DpsKey, value: Value) {
        self.entries.insert(key, DpsEntry { value, dirty: true });
    }

    pub fn get(&self, key: DpsKey) -> Option<&Value> {
        self.entries.get(&key).map(|e| &e.value)
    }

    #[cfg(test)]
    pub fn is_dirty(&self, key: DpsKey) -> bool {
        self.entries.get(&key).is_some_and(|e| e.dirty)
    }

    /// Force a known key to be republished. Unknown keys are left alone.
    pub fn mark_dirty(&mut self, key: DpsKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.dirty = true;
        }
    }

    pub fn clear_dirty(&mut self, key: DpsKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.dirty = false;
        }
    }

    pub fn dirty_keys(&self) -> Vec<DpsKey> {
        self.entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All cached values as one `{"<key>": value}` object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, e)| (k.to_string(), e.value.clone()))
                .collect(),
        )
    }
}
