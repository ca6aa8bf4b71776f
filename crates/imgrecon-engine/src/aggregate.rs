//! Roll classification and per-object outcomes up into one dataset report.

use imgrecon_core::{
    DatasetIssue, DatasetRecord, DatasetReport, Inconsistency, IssueKind, MappingCounts,
    ObjectError, ObjectErrors,
};

use crate::classify::Classification;

const VIEWER_UPDATE_DETAIL: &str =
    "No viewer images will be displayed. Viewer data update may be required.";
const CATALOG_UPDATE_DETAIL: &str =
    "No viewer images will be displayed. Catalog metadata update may be required.";
const DUPLICATE_FURTHER: &str =
    "Issues may occur on thumbnail or viewer. More detail will be shown in object errors.";

fn warning(kind: IssueKind, reason: &str, detail: &str) -> DatasetIssue {
    DatasetIssue {
        kind,
        reason: reason.to_string(),
        detail: Some(detail.to_string()),
        ids: Vec::new(),
        total: None,
        further: None,
    }
}

/// At most one presence warning; the three conditions are disjoint.
pub fn presence_warning(classification: &Classification) -> Option<DatasetIssue> {
    let Classification {
        viewer_object_found: object,
        viewer_image_found: image,
        identifiers_match,
        ..
    } = *classification;

    match (object, image) {
        (true, false) => Some(warning(
            IssueKind::ViewerImagesMissing,
            "One or more viewer ids found on the catalog but no image information is found on the viewer.",
            VIEWER_UPDATE_DETAIL,
        )),
        (true, true) if !identifiers_match => Some(warning(
            IssueKind::ViewerIdentifierMismatch,
            "Specific viewer ids found on the catalog but no image information is found on the viewer.",
            VIEWER_UPDATE_DETAIL,
        )),
        (false, true) => Some(warning(
            IssueKind::CatalogIdentifiersMissing,
            "Image information is found on the viewer but no viewer id is found on the catalog.",
            CATALOG_UPDATE_DETAIL,
        )),
        _ => None,
    }
}

/// Error listing duplicate ids that no member of the group could resolve.
pub fn duplicate_error<I>(unresolved: I) -> Option<DatasetIssue>
where
    I: IntoIterator<Item = String>,
{
    let mut ids: Vec<String> = unresolved.into_iter().collect();
    if ids.is_empty() {
        return None;
    }
    ids.sort();
    ids.dedup();
    Some(DatasetIssue {
        kind: IssueKind::DuplicateIdentifiers,
        reason: "Duplicate image ids are found on the catalog.".to_string(),
        detail: Some(format!("Redundant images are found on {}.", ids.join(", "))),
        total: Some(ids.len()),
        ids,
        further: Some(DUPLICATE_FURTHER.to_string()),
    })
}

pub fn missing_version_error() -> DatasetIssue {
    DatasetIssue {
        kind: IssueKind::MissingVersion,
        reason: "Missing version".to_string(),
        detail: Some("The catalog record carries no storage version; objects were not tested.".to_string()),
        ids: Vec::new(),
        total: None,
        further: None,
    }
}

fn counts(total: usize, mapped: usize) -> Option<MappingCounts> {
    (total > 0).then(|| MappingCounts {
        total,
        mapped,
        unmapped: total - mapped,
    })
}

/// The inconsistency breakdown only appears when some error needs a mapping.
pub fn summarize_objects(objects: Vec<ObjectError>) -> ObjectErrors {
    let name_total = objects.iter().filter(|e| e.needs_name_mapping()).count();
    let name_mapped = objects.iter().filter(|e| e.name_mapping_solved()).count();
    let path_total = objects.iter().filter(|e| e.needs_path_mapping()).count();
    let path_mapped = objects.iter().filter(|e| e.path_mapping_solved()).count();

    let inconsistency_total = name_total + path_total;
    let inconsistency = (inconsistency_total > 0).then(|| Inconsistency {
        total: inconsistency_total,
        name: counts(name_total, name_mapped),
        path: counts(path_total, path_mapped),
    });

    ObjectErrors {
        total: objects.len(),
        objects,
        inconsistency,
    }
}

pub fn build_report(
    record: &DatasetRecord,
    classification: &Classification,
    unresolved_duplicates: Vec<String>,
    objects: Vec<ObjectError>,
) -> DatasetReport {
    let mut report = DatasetReport::for_dataset(record);
    report.viewer_present = classification.viewer_object_found || classification.viewer_image_found;
    report.warnings.extend(presence_warning(classification));
    report.errors.extend(duplicate_error(unresolved_duplicates));
    report.object_errors = summarize_objects(objects);
    report
}
