//! Held-input bookkeeping for one in-flight `InputSequence`.
//!
//! A hold-flagged (`_`) input stays pressed past its own chord's release
//! step and is tracked here until either a later subsequence in the same
//! sequence explicitly releases it (`-`) or the sequence ends, at which
//! point everything still held is released. Holds never carry across
//! separate chat messages — each sequence starts and ends with an empty
//! set, which is the chosen resolution for the cross-message hold-leak
//! question the chat grammar leaves open.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use core_hid::VirtualHidBackend;
use core_state::ControllerManager;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeldEntry {
    pub name: String,
    pub port: usize,
    pub is_axis: bool,
}

#[derive(Debug, Default)]
pub struct HeldSet(HashSet<HeldEntry>);

impl HeldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: HeldEntry) {
        self.0.insert(entry);
    }

    /// Removes a held entry for `name`/`port` if present, reporting whether
    /// there was one to clear. Used by an explicit release flag so it never
    /// re-presses something that wasn't actually held.
    pub fn take(&mut self, name: &str, port: usize) -> bool {
        let probe = HeldEntry {
            name: name.to_string(),
            port,
            is_axis: false,
        };
        if self.0.remove(&probe) {
            return true;
        }
        let axis_probe = HeldEntry {
            is_axis: true,
            ..probe
        };
        self.0.remove(&axis_probe)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Releases everything still held, e.g. at sequence end or on
    /// cancellation. Leaves the set empty regardless of per-entry errors so
    /// a single stuck device can't wedge the rest of the drain.
    pub fn release_all<B: VirtualHidBackend>(&mut self, controllers: &Arc<Mutex<ControllerManager<B>>>) {
        if self.0.is_empty() {
            return;
        }
        let entries: Vec<HeldEntry> = self.0.drain().collect();
        let mut mgr = controllers.lock().expect("controller manager lock poisoned");
        for entry in &entries {
            let result = if entry.is_axis {
                mgr.set_axis(entry.port, &entry.name, 0)
            } else {
                mgr.release_button(entry.port, &entry.name)
            };
            if let Err(err) = result {
                tracing::warn!(target: "actions.hold", port = entry.port, name = %entry.name, error = %err, "release_all failed for held input");
            }
        }
        for entry in &entries {
            let _ = mgr.update(entry.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_hid::NullHidBackend;

    #[test]
    fn take_removes_matching_entry_only() {
        let mut held = HeldSet::new();
        held.insert(HeldEntry {
            name: "a".into(),
            port: 0,
            is_axis: false,
        });
        assert!(!held.take("a", 1));
        assert!(held.take("a", 0));
        assert!(!held.take("a", 0));
    }

    #[test]
    fn release_all_drains_and_calls_backend() {
        let controllers = Arc::new(Mutex::new(ControllerManager::new(NullHidBackend::new(), 1)));
        controllers.lock().unwrap().acquire(0).unwrap();
        controllers.lock().unwrap().press(0, "a").unwrap();
        let mut held = HeldSet::new();
        held.insert(HeldEntry {
            name: "a".into(),
            port: 0,
            is_axis: false,
        });
        held.release_all(&controllers);
        assert!(held.is_empty());
        assert!(!controllers.lock().unwrap().is_pressed(0, "a"));
    }
}
