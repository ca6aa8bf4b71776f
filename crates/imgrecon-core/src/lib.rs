//! Core domain model for catalog/storage/viewer image reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "imgrecon-core";

/// Sentinel the catalog uses for an absent mimetype block.
pub const NOT_SPECIFIED: &str = "not-specified";

/// Bucket used when the catalog record carries no storage uri.
pub const DEFAULT_BUCKET: &str = "pennsieve-prod-discover-publish-use1";

pub const MIMETYPES_2D: &[&str] = &["image/jp2", "image/vnd.ome.xml+jp2"];
pub const MIMETYPES_3D: &[&str] = &["image/jpx", "image/vnd.ome.xml+jpx"];

/// Outcome of a single collaborator lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    /// Transport or availability failure, carried as a reportable message.
    Unavailable(String),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound | Self::Unavailable(_) => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MimeClass {
    TwoD,
    ThreeD,
    Other,
}

impl MimeClass {
    pub fn from_mimetype(mimetype: &str) -> Self {
        if MIMETYPES_2D.contains(&mimetype) {
            Self::TwoD
        } else if MIMETYPES_3D.contains(&mimetype) {
            Self::ThreeD
        } else {
            Self::Other
        }
    }

    /// Only 2D and 3D viewer images take part in matching.
    pub fn is_viewer_image(self) -> bool {
        matches!(self, Self::TwoD | Self::ThreeD)
    }
}

/// The catalog's `additional_mimetype` block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdditionalMimetype {
    #[default]
    NotSpecified,
    Named(Option<String>),
}

/// The catalog's `biolucida` block; present but possibly without an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewerRef {
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageObject {
    pub dataset_path: String,
    pub viewer: Option<ViewerRef>,
    pub mimetype: Option<String>,
    #[serde(default)]
    pub additional_mimetype: AdditionalMimetype,
}

impl ImageObject {
    pub fn declares_viewer_block(&self) -> bool {
        self.viewer.is_some()
    }

    /// Non-empty viewer identifier, if the object declares one.
    pub fn viewer_id(&self) -> Option<&str> {
        self.viewer
            .as_ref()
            .and_then(|v| v.identifier.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Additional mimetype wins over the primary one when it names something.
    pub fn resolved_mimetype(&self) -> &str {
        if let AdditionalMimetype::Named(Some(name)) = &self.additional_mimetype {
            if !name.is_empty() {
                return name;
            }
        }
        self.mimetype
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(NOT_SPECIFIED)
    }

    pub fn mime_class(&self) -> MimeClass {
        MimeClass::from_mimetype(self.resolved_mimetype())
    }

    /// Catalog path rooted under `files/`.
    pub fn catalog_path(&self) -> String {
        if self.dataset_path.contains("files/") {
            self.dataset_path.clone()
        } else {
            format!("files/{}", self.dataset_path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: String,
    pub version: Option<String>,
    pub name: Option<String>,
    pub doi: Option<String>,
    pub bucket: String,
    pub objects: Vec<ImageObject>,
}

impl DatasetRecord {
    /// Version identifier when the catalog supplied a usable one.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref().filter(|v| !v.is_empty())
    }
}

/// Extract the bucket from a storage uri such as `s3://bucket/123`.
pub fn bucket_from_uri(uri: &str) -> Option<String> {
    uri.split('/')
        .nth(2)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerPermission {
    Granted,
    Denied,
}

/// Read-only snapshot of the viewer's per-image info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerImageInfo {
    pub viewer_id: String,
    pub name: Option<String>,
    pub permission: ViewerPermission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFile {
    pub path: String,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Required,
    /// Known inconsistency already covered by the curated override tables.
    Solved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateVerdict {
    /// None of the duplicate records match the viewer.
    MetadataRequired,
    /// At least one duplicate matches; the rest are stale.
    CleanUpRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectErrorKind {
    ViewerUnavailable,
    PermissionDenied,
    ImageNameMissing,
    FolderNotFound,
    FileNotFound,
    NameConflict,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    pub catalog_path: String,
    pub viewer_id: String,
    pub kind: ObjectErrorKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub further: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_mapping: Option<MappingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_mapping: Option<MappingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateVerdict>,
}

impl ObjectError {
    pub fn new(
        catalog_path: impl Into<String>,
        viewer_id: impl Into<String>,
        kind: ObjectErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            viewer_id: viewer_id.into(),
            kind,
            reason: reason.into(),
            detail: None,
            further: None,
            name_mapping: None,
            path_mapping: None,
            duplicate: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn needs_name_mapping(&self) -> bool {
        self.name_mapping.is_some()
    }

    pub fn name_mapping_solved(&self) -> bool {
        self.name_mapping == Some(MappingStatus::Solved)
    }

    pub fn needs_path_mapping(&self) -> bool {
        self.path_mapping.is_some()
    }

    pub fn path_mapping_solved(&self) -> bool {
        self.path_mapping == Some(MappingStatus::Solved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ViewerImagesMissing,
    ViewerIdentifierMismatch,
    CatalogIdentifiersMissing,
    DuplicateIdentifiers,
    MissingVersion,
}

/// Dataset-level warning or error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetIssue {
    pub kind: IssueKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub further: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MappingCounts {
    pub total: usize,
    pub mapped: usize,
    pub unmapped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inconsistency {
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<MappingCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<MappingCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectErrors {
    pub total: usize,
    pub objects: Vec<ObjectError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inconsistency: Option<Inconsistency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub id: String,
    pub version: Option<String>,
    pub name: Option<String>,
    pub doi: Option<String>,
    pub warnings: Vec<DatasetIssue>,
    pub errors: Vec<DatasetIssue>,
    pub object_errors: ObjectErrors,
    pub viewer_present: bool,
}

impl DatasetReport {
    pub fn for_dataset(record: &DatasetRecord) -> Self {
        Self {
            id: record.id.clone(),
            version: record.version.clone(),
            name: record.name.clone(),
            doi: record.doi.clone(),
            warnings: Vec::new(),
            errors: Vec::new(),
            object_errors: ObjectErrors::default(),
            viewer_present: false,
        }
    }

    pub fn failed(&self) -> bool {
        !self.errors.is_empty() || self.object_errors.total > 0
    }

    pub fn warned(&self) -> bool {
        !self.failed() && !self.warnings.is_empty()
    }
}

/// Aggregate pass/warn/fail counts over one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tested: usize,
    pub tested_with_viewer: usize,
    pub warned: usize,
    pub failed: usize,
    pub warned_ids: Vec<String>,
    pub failed_ids: Vec<String>,
    pub warned_datasets: Vec<DatasetReport>,
    pub failed_datasets: Vec<DatasetReport>,
}

impl RunSummary {
    pub fn start(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            tested: 0,
            tested_with_viewer: 0,
            warned: 0,
            failed: 0,
            warned_ids: Vec::new(),
            failed_ids: Vec::new(),
            warned_datasets: Vec::new(),
            failed_datasets: Vec::new(),
        }
    }

    /// Count a catalog hit that carried no storage identifier.
    pub fn record_skipped(&mut self) {
        self.tested += 1;
    }

    pub fn record(&mut self, report: DatasetReport) {
        self.tested += 1;
        if report.viewer_present {
            self.tested_with_viewer += 1;
        }
        if report.failed() {
            self.failed += 1;
            self.failed_ids.push(report.id.clone());
            self.failed_datasets.push(report);
        } else if report.warned() {
            self.warned += 1;
            self.warned_ids.push(report.id.clone());
            self.warned_datasets.push(report);
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
    }

    pub fn passed(&self) -> bool {
        self.failed == 0
    }
}
