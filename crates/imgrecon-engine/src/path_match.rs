//! Decide whether a catalog-declared path exists in storage.

use std::collections::HashMap;

use imgrecon_core::{DatasetRecord, Lookup, MappingStatus, ObjectError, ObjectErrorKind, StorageFile};
use imgrecon_sources::{OverrideTables, SourceError, StorageSource};
use tracing::{debug, warn};

use crate::mapping::MappingCache;

pub const FOLDER_NOT_FOUND: &str = "Folder path cannot be found on storage.";
pub const FILE_NOT_FOUND: &str = "File path cannot be found on storage.";
pub const PATH_MAPPING_FURTHER: &str = "Correct file path is found through storage metadata.";

/// Folder listings and dataset metadata fetched while testing one dataset.
/// Empty results are not cached.
#[derive(Debug, Default)]
pub struct FetchCache {
    folders: HashMap<String, Vec<StorageFile>>,
    metadata: HashMap<(String, String), Vec<StorageFile>>,
}

impl FetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_folders(&self) -> usize {
        self.folders.len()
    }
}

/// `files/a/b.png` -> (`files/a`, `b.png`).
pub fn split_catalog_path(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

/// Keep only `[.a-zA-Z0-9]` runs, space-joined and lower-cased.
pub fn normalize_tokens(input: &str) -> String {
    input
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.'))
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// Exact case-insensitive path hit, or a listed file whose uri folder is
/// contained in the catalog path.
pub fn listing_contains(files: &[StorageFile], catalog_path: &str) -> bool {
    let lowered = catalog_path.to_lowercase();
    files.iter().any(|file| {
        if file.path.to_lowercase() == lowered {
            return true;
        }
        file.uri
            .as_deref()
            .and_then(|uri| uri.rsplit_once('/'))
            .map(|(folder, _)| folder.to_lowercase())
            .is_some_and(|folder| !folder.is_empty() && lowered.contains(&folder))
    })
}

/// First metadata entry matching the file name directly or after normalization.
pub fn metadata_match<'a>(files: &'a [StorageFile], file_name: &str) -> Option<&'a StorageFile> {
    if file_name.is_empty() {
        return None;
    }
    let normalized_name = normalize_tokens(file_name);
    files.iter().find(|file| {
        file.path.contains(file_name)
            || (!normalized_name.is_empty()
                && normalize_tokens(&file.path).contains(&normalized_name))
    })
}

pub struct PathMatcher<'a> {
    pub storage: &'a dyn StorageSource,
    pub cache: &'a mut FetchCache,
    pub mappings: &'a MappingCache,
    pub overrides: &'a OverrideTables,
}

impl PathMatcher<'_> {
    /// `None` when the path resolves directly in storage.
    pub async fn check(
        &mut self,
        dataset: &DatasetRecord,
        catalog_path: &str,
        viewer_id: &str,
    ) -> Result<Option<ObjectError>, SourceError> {
        let (folder, file_name) = split_catalog_path(catalog_path);
        let files = self.folder_listing(dataset, folder).await?;

        let (kind, reason) = if files.is_empty() {
            (ObjectErrorKind::FolderNotFound, FOLDER_NOT_FOUND)
        } else if listing_contains(&files, catalog_path) {
            return Ok(None);
        } else {
            (ObjectErrorKind::FileNotFound, FILE_NOT_FOUND)
        };

        let mut error = ObjectError::new(catalog_path, viewer_id, kind, reason);
        let metadata = self.dataset_metadata(dataset).await?;
        if let Some(hit) = metadata_match(&metadata, file_name) {
            debug!(dataset = %dataset.id, catalog_path, storage_path = %hit.path, "path resolved through metadata");
            self.mappings.record_path(&dataset.id, catalog_path, &hit.path);
            error.further = Some(PATH_MAPPING_FURTHER.to_string());
            error.path_mapping = Some(if self.overrides.is_known_path(catalog_path) {
                MappingStatus::Solved
            } else {
                MappingStatus::Required
            });
        }
        Ok(Some(error))
    }

    async fn folder_listing(
        &mut self,
        dataset: &DatasetRecord,
        folder: &str,
    ) -> Result<Vec<StorageFile>, SourceError> {
        if let Some(files) = self.cache.folders.get(folder) {
            return Ok(files.clone());
        }
        let files = match self.storage.browse(dataset, folder).await? {
            Lookup::Found(files) => files,
            Lookup::NotFound => Vec::new(),
            Lookup::Unavailable(reason) => {
                warn!(dataset = %dataset.id, folder, %reason, "storage folder listing unavailable");
                Vec::new()
            }
        };
        if !files.is_empty() {
            self.cache.folders.insert(folder.to_string(), files.clone());
        }
        Ok(files)
    }

    async fn dataset_metadata(&mut self, dataset: &DatasetRecord) -> Result<Vec<StorageFile>, SourceError> {
        let key = (
            dataset.id.clone(),
            dataset.version().unwrap_or_default().to_string(),
        );
        if let Some(files) = self.cache.metadata.get(&key) {
            return Ok(files.clone());
        }
        let files = match self.storage.metadata(dataset).await? {
            Lookup::Found(files) => files,
            Lookup::NotFound => Vec::new(),
            Lookup::Unavailable(reason) => {
                warn!(dataset = %dataset.id, %reason, "storage metadata unavailable");
                Vec::new()
            }
        };
        if !files.is_empty() {
            self.cache.metadata.insert(key, files.clone());
        }
        Ok(files)
    }
}
