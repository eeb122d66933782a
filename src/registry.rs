use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{Peripheral, PeripheralId, PeripheralPatch};

/// Registry shared between the scan controller, the command sequencer and the UI
pub type SharedRegistry = Arc<RwLock<PeripheralRegistry>>;

/// In-memory collection of discovered peripherals
///
/// Entries keep first-seen order across updates so list rendering stays
/// stable. A separate set of known identifiers backs duplicate filtering
/// during a scan session; it survives [`PeripheralRegistry::remove`] and is
/// only reset by [`PeripheralRegistry::reset_session`].
#[derive(Debug, Default)]
pub struct PeripheralRegistry {
    entries: Vec<Peripheral>,
    index: HashMap<PeripheralId, usize>,
    known: HashSet<PeripheralId>,
}

impl PeripheralRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry wrapped for sharing
    #[must_use]
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Insert a peripheral, or replace the entry with the same id in place
    pub fn upsert(&mut self, peripheral: Peripheral) {
        if let Some(&position) = self.index.get(&peripheral.id) {
            self.entries[position] = peripheral;
        } else {
            self.index.insert(peripheral.id.clone(), self.entries.len());
            self.entries.push(peripheral);
        }
    }

    /// Merge a patch into an existing entry
    ///
    /// Returns `false` and leaves the registry untouched when `id` is absent.
    pub fn update(&mut self, id: &PeripheralId, patch: &PeripheralPatch) -> bool {
        match self.index.get(id) {
            Some(&position) => {
                patch.apply(&mut self.entries[position]);
                true
            }
            None => {
                debug!("Ignoring update for unknown peripheral {}", id);
                false
            }
        }
    }

    /// Remove an entry, keeping its id known for the rest of the session
    pub fn remove(&mut self, id: &PeripheralId) -> Option<Peripheral> {
        let position = self.index.remove(id)?;
        let removed = self.entries.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Remove every entry and forget every known id
    pub fn reset_session(&mut self) {
        self.clear();
        self.known.clear();
    }

    /// Record an id as seen in this scan session
    ///
    /// Returns `false` if the id was already known.
    pub fn mark_known(&mut self, id: &PeripheralId) -> bool {
        self.known.insert(id.clone())
    }

    /// Whether an id was seen in this scan session
    #[must_use]
    pub fn is_known(&self, id: &PeripheralId) -> bool {
        self.known.contains(id)
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.index.get(id).map(|&position| &self.entries[position])
    }

    /// Entries in first-seen order
    #[must_use]
    pub fn peripherals(&self) -> &[Peripheral] {
        &self.entries
    }

    /// Copy of the entries for rendering
    #[must_use]
    pub fn snapshot(&self) -> Vec<Peripheral> {
        self.entries.clone()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
