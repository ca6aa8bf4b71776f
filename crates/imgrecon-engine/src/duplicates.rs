//! Reduce independently tested duplicate objects to one outcome per viewer id.

use std::collections::BTreeMap;

use imgrecon_core::{DuplicateVerdict, ImageObject, ObjectError, ObjectErrorKind};

use crate::classify::IdentifierSets;
use crate::mapping::MappingCache;

/// Image objects sharing each duplicate viewer id, in catalog order.
pub fn group_duplicates<'a>(
    objects: &'a [ImageObject],
    sets: &IdentifierSets,
) -> BTreeMap<String, Vec<&'a ImageObject>> {
    let mut groups: BTreeMap<String, Vec<&ImageObject>> = BTreeMap::new();
    for object in objects {
        let Some(id) = object.viewer_id() else {
            continue;
        };
        if sets.both_duplicate.contains(id) && object.mime_class().is_viewer_image() {
            groups.entry(id.to_string()).or_default().push(object);
        }
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateOutcome {
    pub viewer_id: String,
    /// Members tested.
    pub duplicate_count: usize,
    /// Members that failed name matching.
    pub name_mapping_required_count: usize,
    /// Members whose name check ran and matched.
    pub clean_count: usize,
    pub errors: Vec<ObjectError>,
}

impl DuplicateOutcome {
    /// At least one member matched the viewer name.
    pub fn disambiguated(&self) -> bool {
        self.clean_count > 0
    }
}

/// Errors that stop the per-object test before the name comparison.
fn name_not_verified(error: &ObjectError) -> bool {
    matches!(
        error.kind,
        ObjectErrorKind::NameConflict
            | ObjectErrorKind::ViewerUnavailable
            | ObjectErrorKind::PermissionDenied
            | ObjectErrorKind::ImageNameMissing
            | ObjectErrorKind::Unexpected
    )
}

/// `member_errors` holds one entry per tested member. A clean name match on
/// any member removes every name mapping recorded for the id, including ones
/// its failing siblings just added.
pub fn resolve_group(
    dataset_id: &str,
    viewer_id: &str,
    member_errors: Vec<Vec<ObjectError>>,
    mappings: &MappingCache,
) -> DuplicateOutcome {
    let duplicate_count = member_errors.len();
    let name_mapping_required_count = member_errors
        .iter()
        .filter(|errors| errors.iter().any(ObjectError::needs_name_mapping))
        .count();
    let clean_count = member_errors
        .iter()
        .filter(|errors| !errors.iter().any(name_not_verified))
        .count();

    let verdict = if name_mapping_required_count == duplicate_count {
        Some(DuplicateVerdict::MetadataRequired)
    } else if name_mapping_required_count > 0 {
        Some(DuplicateVerdict::CleanUpRequired)
    } else {
        None
    };

    let mut errors: Vec<ObjectError> = member_errors.into_iter().flatten().collect();
    if let Some(verdict) = verdict {
        for error in errors
            .iter_mut()
            .filter(|e| e.needs_name_mapping() && !e.name_mapping_solved())
        {
            error.duplicate = Some(verdict);
        }
    }

    let outcome = DuplicateOutcome {
        viewer_id: viewer_id.to_string(),
        duplicate_count,
        name_mapping_required_count,
        clean_count,
        errors,
    };
    if outcome.disambiguated() {
        mappings.clear_viewer_id(dataset_id, viewer_id);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgrecon_core::{AdditionalMimetype, MappingStatus, ObjectErrorKind, ViewerRef};

    fn name_failure(path: &str, solved: bool) -> ObjectError {
        let mut error = ObjectError::new(path, "1", ObjectErrorKind::NameConflict, "conflict");
        error.name_mapping = Some(if solved {
            MappingStatus::Solved
        } else {
            MappingStatus::Required
        });
        error
    }

    fn path_failure(path: &str) -> ObjectError {
        ObjectError::new(path, "1", ObjectErrorKind::FileNotFound, "missing")
    }

    fn object(path: &str, id: &str, mimetype: &str) -> ImageObject {
        ImageObject {
            dataset_path: path.to_string(),
            viewer: Some(ViewerRef {
                identifier: Some(id.to_string()),
            }),
            mimetype: Some(mimetype.to_string()),
            additional_mimetype: AdditionalMimetype::NotSpecified,
        }
    }

    #[test]
    fn groups_only_image_members_of_duplicate_ids() {
        let objects = vec![
            object("files/a.jp2", "1", "image/jp2"),
            object("files/b.jp2", "1", "image/jp2"),
            object("files/b.json", "1", "application/json"),
            object("files/c.jp2", "2", "image/jp2"),
        ];
        let mut sets = IdentifierSets::default();
        sets.both_duplicate.insert("1".into());
        sets.both_unique.insert("2".into());

        let groups = group_duplicates(&objects, &sets);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["1"].len(), 2);
    }

    #[test]
    fn all_failing_members_need_metadata() {
        let mappings = MappingCache::new();
        mappings.record_name("292", "1", "files/a.jp2", "x", "a.jp2");
        let outcome = resolve_group(
            "292",
            "1",
            vec![
                vec![name_failure("files/a.jp2", false)],
                vec![name_failure("files/b.jp2", false)],
            ],
            &mappings,
        );

        assert!(!outcome.disambiguated());
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.duplicate == Some(DuplicateVerdict::MetadataRequired)));
        assert!(mappings.has_name_entry("292", "1"));
    }

    #[test]
    fn one_of_three_failing_is_cleanup_and_clears_mapping() {
        let mappings = MappingCache::new();
        mappings.record_name("292", "1", "files/c.jp2", "slide", "c.jp2");
        let outcome = resolve_group(
            "292",
            "1",
            vec![vec![], vec![], vec![name_failure("files/c.jp2", false)]],
            &mappings,
        );

        assert_eq!(outcome.duplicate_count, 3);
        assert_eq!(outcome.name_mapping_required_count, 1);
        assert!(outcome.disambiguated());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            outcome.errors[0].duplicate,
            Some(DuplicateVerdict::CleanUpRequired)
        );
        assert!(!mappings.has_name_entry("292", "1"));
        assert!(mappings.snapshot().names.is_empty());
    }

    #[test]
    fn solved_failures_and_path_failures_get_no_verdict() {
        let mappings = MappingCache::new();
        let outcome = resolve_group(
            "292",
            "1",
            vec![
                vec![path_failure("files/a.jp2")],
                vec![name_failure("files/b.jp2", true)],
            ],
            &mappings,
        );

        assert!(outcome.disambiguated());
        assert!(outcome.errors.iter().all(|e| e.duplicate.is_none()));
    }

    #[test]
    fn viewer_failures_never_disambiguate() {
        let mappings = MappingCache::new();
        let unavailable = |path: &str| {
            ObjectError::new(path, "1", ObjectErrorKind::ViewerUnavailable, "down")
        };
        let outcome = resolve_group(
            "292",
            "1",
            vec![vec![unavailable("files/a.jp2")], vec![unavailable("files/b.jp2")]],
            &mappings,
        );

        assert_eq!(outcome.name_mapping_required_count, 0);
        assert!(!outcome.disambiguated());
        assert!(outcome.errors.iter().all(|e| e.duplicate.is_none()));
    }
}
