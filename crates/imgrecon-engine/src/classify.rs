//! Partition catalog-declared viewer identifiers against the viewer's own listing.

use std::collections::BTreeSet;

use imgrecon_core::{ImageObject, Lookup};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentifierSets {
    /// Listed by the viewer, never declared by the catalog.
    pub viewer_only: BTreeSet<String>,
    /// Declared by the catalog, unknown to the viewer.
    pub catalog_only: BTreeSet<String>,
    /// Present on both sides exactly once among image objects.
    pub both_unique: BTreeSet<String>,
    /// Present on both sides and declared by more than one image object.
    pub both_duplicate: BTreeSet<String>,
    /// Objects with a viewer block but no identifier; counts the null
    /// entry `catalog_only` would otherwise hold.
    pub unidentified: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub sets: IdentifierSets,
    pub viewer_object_found: bool,
    pub viewer_image_found: bool,
    pub identifiers_match: bool,
}

/// `viewer_images` is the viewer's dataset listing; anything but a non-empty
/// `Found` classifies against an empty id set.
pub fn classify(objects: &[ImageObject], viewer_images: &Lookup<Vec<String>>) -> Classification {
    let (viewer_image_found, viewer_ids): (bool, BTreeSet<String>) = match viewer_images {
        Lookup::Found(ids) if !ids.is_empty() => (true, ids.iter().cloned().collect()),
        _ => (false, BTreeSet::new()),
    };

    let mut sets = IdentifierSets::default();
    let mut declared = BTreeSet::new();
    let mut viewer_object_found = false;
    let mut identifiers_match = true;

    for object in objects.iter().filter(|o| o.declares_viewer_block()) {
        let Some(id) = object.viewer_id() else {
            sets.unidentified += 1;
            identifiers_match = false;
            debug!(path = %object.dataset_path, "viewer block without identifier");
            continue;
        };
        viewer_object_found = true;
        declared.insert(id.to_string());

        if !viewer_ids.contains(id) {
            identifiers_match = false;
            sets.catalog_only.insert(id.to_string());
            continue;
        }

        if !object.mime_class().is_viewer_image() {
            continue;
        }

        if sets.both_duplicate.contains(id) {
            continue;
        }
        if sets.both_unique.remove(id) {
            sets.both_duplicate.insert(id.to_string());
        } else {
            sets.both_unique.insert(id.to_string());
        }
    }

    sets.viewer_only = viewer_ids.difference(&declared).cloned().collect();

    Classification {
        sets,
        viewer_object_found,
        viewer_image_found,
        identifiers_match,
    }
}
