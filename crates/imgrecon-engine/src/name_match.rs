//! Compare the viewer's display name with the resolved path's filename.

use imgrecon_core::{MappingStatus, MimeClass, ObjectError, ObjectErrorKind};
use imgrecon_sources::OverrideTables;

use crate::mapping::MappingCache;

pub const NAME_MAPPING_FURTHER: &str = "Check the name mapping output for the expected filename.";

/// Conflict wording differs by class: 2D images are browsed straight from
/// storage, 3D images are only reached through catalog metadata.
fn conflict_message(mime: MimeClass) -> (&'static str, &'static str) {
    match mime {
        MimeClass::TwoD => (
            "Conflict between storage and viewer response.",
            "FILE VIEWER: viewer filename does not match the storage filename.",
        ),
        MimeClass::ThreeD | MimeClass::Other => (
            "Conflict between catalog and viewer response.",
            "VIEWER: viewer filename does not match the catalog filename.",
        ),
    }
}

pub struct NameCheck<'a> {
    pub dataset_id: &'a str,
    pub viewer_id: &'a str,
    pub catalog_path: &'a str,
    pub display_name: &'a str,
    pub mime: MimeClass,
}

/// Raw final-segment comparison, extension included. A mismatch is always
/// recorded into the name mapping.
pub fn check_name(
    check: &NameCheck<'_>,
    mappings: &MappingCache,
    overrides: &OverrideTables,
) -> Option<ObjectError> {
    let resolved = mappings
        .resolved_path(check.dataset_id, check.catalog_path)
        .unwrap_or_else(|| check.catalog_path.to_string());
    let filename = resolved.rsplit('/').next().unwrap_or(resolved.as_str());
    if check.display_name == filename {
        return None;
    }

    mappings.record_name(
        check.dataset_id,
        check.viewer_id,
        &resolved,
        check.display_name,
        filename,
    );

    let (reason, detail) = conflict_message(check.mime);
    let mut error = ObjectError::new(
        check.catalog_path,
        check.viewer_id,
        ObjectErrorKind::NameConflict,
        reason,
    )
    .with_detail(detail);
    error.further = Some(NAME_MAPPING_FURTHER.to_string());
    error.name_mapping = Some(if overrides.is_known_name(check.display_name) {
        MappingStatus::Solved
    } else {
        MappingStatus::Required
    });
    Some(error)
}
