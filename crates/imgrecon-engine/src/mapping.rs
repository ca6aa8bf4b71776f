//! Run-scoped name/path discrepancy accumulators.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// dataset id -> viewer id -> resolved path -> reported name -> expected filename.
pub type NameMapping =
    BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>>;

/// dataset id -> catalog path -> storage path.
pub type PathMapping = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub names: NameMapping,
    pub paths: PathMapping,
}

/// Shared across datasets of one run. Every method holds the lock for its
/// whole read-modify-write, so concurrent datasets never interleave inside one.
#[derive(Debug, Default)]
pub struct MappingCache {
    state: Mutex<MappingSnapshot>,
}

impl MappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from mappings carried over from an earlier run.
    pub fn from_snapshot(snapshot: MappingSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MappingSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_name(
        &self,
        dataset_id: &str,
        viewer_id: &str,
        resolved_path: &str,
        reported_name: &str,
        expected_filename: &str,
    ) {
        self.lock()
            .names
            .entry(dataset_id.to_string())
            .or_default()
            .entry(viewer_id.to_string())
            .or_default()
            .entry(resolved_path.to_string())
            .or_default()
            .insert(reported_name.to_string(), expected_filename.to_string());
    }

    pub fn record_path(&self, dataset_id: &str, catalog_path: &str, storage_path: &str) {
        self.lock()
            .paths
            .entry(dataset_id.to_string())
            .or_default()
            .insert(catalog_path.to_string(), storage_path.to_string());
    }

    /// Storage path previously discovered for a catalog path.
    pub fn resolved_path(&self, dataset_id: &str, catalog_path: &str) -> Option<String> {
        self.lock()
            .paths
            .get(dataset_id)
            .and_then(|paths| paths.get(catalog_path))
            .cloned()
    }

    pub fn has_name_entry(&self, dataset_id: &str, viewer_id: &str) -> bool {
        self.lock()
            .names
            .get(dataset_id)
            .is_some_and(|ids| ids.contains_key(viewer_id))
    }

    /// Drop every name mapping for `viewer_id`, pruning the dataset entry when
    /// it becomes empty. Returns whether anything was removed.
    pub fn clear_viewer_id(&self, dataset_id: &str, viewer_id: &str) -> bool {
        let mut state = self.lock();
        let Some(ids) = state.names.get_mut(dataset_id) else {
            return false;
        };
        let removed = ids.remove(viewer_id).is_some();
        if ids.is_empty() {
            state.names.remove(dataset_id);
        }
        removed
    }

    pub fn snapshot(&self) -> MappingSnapshot {
        self.lock().clone()
    }
}
