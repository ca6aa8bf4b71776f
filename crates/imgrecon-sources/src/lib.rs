//! Catalog, storage and viewer collaborator contracts plus HTTP and fixture implementations.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use imgrecon_core::{
    bucket_from_uri, AdditionalMimetype, DatasetRecord, ImageObject, Lookup, StorageFile,
    ViewerImageInfo, ViewerPermission, ViewerRef, DEFAULT_BUCKET, NOT_SPECIFIED,
};
use imgrecon_http::{join_url, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "imgrecon-sources";

pub const CATALOG_SERVICE: &str = "catalog";
pub const STORAGE_SERVICE: &str = "storage";
pub const VIEWER_SERVICE: &str = "viewer";

/// Fields requested from the catalog search index.
const CATALOG_SOURCE_FIELDS: &[&str] = &[
    "item.curie",
    "item.name",
    "item.types",
    "objects.biolucida",
    "objects.additional_mimetype",
    "objects.mimetype",
    "objects.dataset",
    "pennsieve.version",
    "pennsieve.identifier",
    "pennsieve.uri",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One page of catalog search hits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    pub records: Vec<DatasetRecord>,
    /// Hits returned by the catalog, including ones without a storage identifier.
    pub hits: usize,
}

impl CatalogPage {
    pub fn skipped(&self) -> usize {
        self.hits.saturating_sub(self.records.len())
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn page(&self, start: usize, size: usize) -> Result<CatalogPage, SourceError>;

    async fn dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>, SourceError>;
}

#[async_trait]
pub trait ViewerSource: Send + Sync {
    /// Image identifiers the viewer knows for a dataset.
    async fn dataset_images(&self, dataset_id: &str) -> Result<Lookup<Vec<String>>, SourceError>;

    async fn image_info(&self, viewer_id: &str) -> Result<Lookup<ViewerImageInfo>, SourceError>;
}

#[async_trait]
pub trait StorageSource: Send + Sync {
    async fn browse(
        &self,
        dataset: &DatasetRecord,
        folder: &str,
    ) -> Result<Lookup<Vec<StorageFile>>, SourceError>;

    async fn metadata(&self, dataset: &DatasetRecord) -> Result<Lookup<Vec<StorageFile>>, SourceError>;
}

/// Walk catalog pages until a short page or `max` hits.
pub async fn collect_datasets(
    catalog: &dyn CatalogSource,
    page_size: usize,
    max: usize,
) -> Result<CatalogPage, SourceError> {
    let page_size = page_size.max(1);
    let mut collected = CatalogPage::default();
    let mut start = 0;
    loop {
        let page = catalog.page(start, page_size).await?;
        let short = page.hits < page_size;
        start += page_size;
        collected.hits += page.hits;
        collected.records.extend(page.records);
        if short || collected.hits >= max {
            break;
        }
    }
    Ok(collected)
}

// Raw response parsing. Missing keys parse as empty rather than failing.

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

/// Identifiers arrive as strings or bare numbers depending on the service.
fn json_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_image_object(raw: &JsonValue) -> ImageObject {
    let viewer = raw.get("biolucida").map(|block| ViewerRef {
        identifier: block.get("identifier").and_then(json_id),
    });
    let additional_mimetype = match raw.get("additional_mimetype") {
        None | Some(JsonValue::Null) => AdditionalMimetype::NotSpecified,
        Some(JsonValue::String(s)) if s == NOT_SPECIFIED => AdditionalMimetype::NotSpecified,
        Some(JsonValue::String(s)) => AdditionalMimetype::Named(Some(s.clone())),
        Some(block) => AdditionalMimetype::Named(json_str(block, &["name"]).map(str::to_string)),
    };
    ImageObject {
        dataset_path: json_str(raw, &["dataset", "path"]).unwrap_or_default().to_string(),
        viewer,
        mimetype: json_str(raw, &["mimetype", "name"]).map(str::to_string),
        additional_mimetype,
    }
}

/// Parse one search hit. Hits without a storage identifier yield `None`.
pub fn parse_catalog_hit(hit: &JsonValue) -> Option<DatasetRecord> {
    let source = hit.get("_source")?;
    let id = source
        .get("pennsieve")
        .and_then(|p| p.get("identifier"))
        .and_then(json_id)?;
    let version = json_path(source, &["pennsieve", "version", "identifier"]).and_then(json_id);
    let bucket = json_str(source, &["pennsieve", "uri"])
        .and_then(bucket_from_uri)
        .unwrap_or_else(|| DEFAULT_BUCKET.to_string());
    let objects = source
        .get("objects")
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().map(parse_image_object).collect())
        .unwrap_or_default();

    Some(DatasetRecord {
        id,
        version,
        name: json_str(source, &["item", "name"]).map(str::to_string),
        doi: json_str(source, &["item", "curie"]).map(str::to_string),
        bucket,
        objects,
    })
}

pub fn parse_catalog_page(body: &JsonValue) -> CatalogPage {
    let hits = json_path(body, &["hits", "hits"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let records = hits
        .iter()
        .filter_map(|hit| {
            let parsed = parse_catalog_hit(hit);
            if parsed.is_none() {
                warn!(hit_id = ?hit.get("_id"), "catalog hit has no storage identifier");
            }
            parsed
        })
        .collect();
    CatalogPage {
        records,
        hits: hits.len(),
    }
}

/// Viewer dataset listing; anything but `status: success` means no images.
pub fn parse_dataset_images(body: &JsonValue) -> Lookup<Vec<String>> {
    if json_str(body, &["status"]) != Some("success") {
        return Lookup::NotFound;
    }
    let ids = body
        .get("dataset_images")
        .and_then(JsonValue::as_array)
        .map(|images| {
            images
                .iter()
                .filter_map(|image| image.get("image_id").and_then(json_id))
                .collect()
        })
        .unwrap_or_default();
    Lookup::Found(ids)
}

pub fn parse_image_info(viewer_id: &str, body: &JsonValue) -> ViewerImageInfo {
    let permission = if json_str(body, &["status"]) == Some("permission denied") {
        ViewerPermission::Denied
    } else {
        ViewerPermission::Granted
    };
    ViewerImageInfo {
        viewer_id: viewer_id.to_string(),
        name: json_str(body, &["name"]).map(str::to_string),
        permission,
    }
}

pub fn parse_storage_files(body: &JsonValue) -> Vec<StorageFile> {
    body.get("files")
        .and_then(JsonValue::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|file| {
                    Some(StorageFile {
                        path: json_str(file, &["path"])?.to_string(),
                        uri: json_str(file, &["uri"]).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn fetch_failure<T>(err: FetchError) -> Result<Lookup<T>, SourceError> {
    match err {
        FetchError::HttpStatus { status: 404, .. } => Ok(Lookup::NotFound),
        FetchError::Decode { .. } => Err(SourceError::Fetch(err)),
        other => Ok(Lookup::Unavailable(other.to_string())),
    }
}

// HTTP implementations.

pub struct HttpCatalog {
    http: Arc<HttpFetcher>,
    host: String,
    api_key: String,
}

impl HttpCatalog {
    pub fn new(http: Arc<HttpFetcher>, host: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            host: host.into(),
            api_key: api_key.into(),
        }
    }

    async fn search(&self, body: JsonValue) -> Result<JsonValue, SourceError> {
        let url = join_url(&self.host, "_search");
        let query = [("api_key", self.api_key.as_str()), ("preference", "imgrecon")];
        Ok(self.http.post_json(CATALOG_SERVICE, &url, &query, &body).await?)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn page(&self, start: usize, size: usize) -> Result<CatalogPage, SourceError> {
        let body = self
            .search(json!({
                "from": start,
                "size": size,
                "_source": CATALOG_SOURCE_FIELDS,
            }))
            .await?;
        Ok(parse_catalog_page(&body))
    }

    async fn dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>, SourceError> {
        let body = self
            .search(json!({
                "size": 1,
                "query": { "term": { "pennsieve.identifier.aggregate": dataset_id } },
                "_source": CATALOG_SOURCE_FIELDS,
            }))
            .await?;
        Ok(parse_catalog_page(&body).records.into_iter().next())
    }
}

pub struct HttpViewer {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl HttpViewer {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ViewerSource for HttpViewer {
    async fn dataset_images(&self, dataset_id: &str) -> Result<Lookup<Vec<String>>, SourceError> {
        let url = join_url(
            &self.endpoint,
            &format!("imagemap/search_dataset/discover/{dataset_id}"),
        );
        match self.http.get_json(VIEWER_SERVICE, &url, &[]).await {
            Ok(body) => Ok(parse_dataset_images(&body)),
            Err(err) => fetch_failure(err),
        }
    }

    async fn image_info(&self, viewer_id: &str) -> Result<Lookup<ViewerImageInfo>, SourceError> {
        let url = join_url(&self.endpoint, &format!("image/info/{viewer_id}"));
        match self.http.get_json(VIEWER_SERVICE, &url, &[]).await {
            Ok(body) => Ok(Lookup::Found(parse_image_info(viewer_id, &body))),
            // Any non-success status is a failed viewer request, 404 included.
            Err(FetchError::Decode { url, source }) => {
                Err(SourceError::Fetch(FetchError::Decode { url, source }))
            }
            Err(err) => Ok(Lookup::Unavailable(err.to_string())),
        }
    }
}

pub struct HttpStorage {
    http: Arc<HttpFetcher>,
    host: String,
}

impl HttpStorage {
    pub fn new(http: Arc<HttpFetcher>, host: impl Into<String>) -> Self {
        Self {
            http,
            host: host.into(),
        }
    }

    fn version_url(&self, dataset: &DatasetRecord, tail: &str) -> String {
        join_url(
            &self.host,
            &format!(
                "datasets/{}/versions/{}/{tail}",
                dataset.id,
                dataset.version().unwrap_or_default()
            ),
        )
    }
}

#[async_trait]
impl StorageSource for HttpStorage {
    async fn browse(
        &self,
        dataset: &DatasetRecord,
        folder: &str,
    ) -> Result<Lookup<Vec<StorageFile>>, SourceError> {
        let url = self.version_url(dataset, "files/browse");
        match self
            .http
            .get_json(STORAGE_SERVICE, &url, &[("path", folder)])
            .await
        {
            Ok(body) => Ok(Lookup::Found(parse_storage_files(&body))),
            Err(err) => fetch_failure(err),
        }
    }

    async fn metadata(&self, dataset: &DatasetRecord) -> Result<Lookup<Vec<StorageFile>>, SourceError> {
        let url = self.version_url(dataset, "metadata");
        match self.http.get_json(STORAGE_SERVICE, &url, &[]).await {
            Ok(body) => Ok(Lookup::Found(parse_storage_files(&body))),
            Err(err) => fetch_failure(err),
        }
    }
}

// Fixture-backed sources for offline runs and tests.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerFixture {
    /// Raw dataset listing responses keyed by dataset id.
    #[serde(default)]
    pub datasets: HashMap<String, JsonValue>,
    /// Raw per-image info responses keyed by viewer id.
    #[serde(default)]
    pub images: HashMap<String, JsonValue>,
    /// Viewer ids whose info request fails at transport level.
    #[serde(default)]
    pub unavailable_images: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageFixture {
    /// dataset id -> folder path -> raw browse response.
    #[serde(default)]
    pub folders: HashMap<String, HashMap<String, JsonValue>>,
    /// dataset id -> raw metadata response.
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDocument {
    /// Raw catalog search hits.
    #[serde(default)]
    pub catalog: Vec<JsonValue>,
    #[serde(default)]
    pub viewer: ViewerFixture,
    #[serde(default)]
    pub storage: StorageFixture,
}

/// Serves all three collaborators from one captured JSON document.
#[derive(Debug, Clone)]
pub struct FixtureSources {
    document: FixtureDocument,
}

impl FixtureSources {
    pub fn new(document: FixtureDocument) -> Self {
        Self { document }
    }

    pub fn from_value(value: JsonValue) -> Result<Self> {
        let document = serde_json::from_value(value).context("parsing fixture document")?;
        Ok(Self::new(document))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let document =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(document))
    }
}

#[async_trait]
impl CatalogSource for FixtureSources {
    async fn page(&self, start: usize, size: usize) -> Result<CatalogPage, SourceError> {
        let hits: Vec<JsonValue> = self
            .document
            .catalog
            .iter()
            .skip(start)
            .take(size)
            .cloned()
            .collect();
        Ok(parse_catalog_page(&json!({ "hits": { "hits": hits } })))
    }

    async fn dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>, SourceError> {
        Ok(self
            .document
            .catalog
            .iter()
            .filter_map(parse_catalog_hit)
            .find(|record| record.id == dataset_id))
    }
}

#[async_trait]
impl ViewerSource for FixtureSources {
    async fn dataset_images(&self, dataset_id: &str) -> Result<Lookup<Vec<String>>, SourceError> {
        Ok(self
            .document
            .viewer
            .datasets
            .get(dataset_id)
            .map(parse_dataset_images)
            .unwrap_or(Lookup::NotFound))
    }

    async fn image_info(&self, viewer_id: &str) -> Result<Lookup<ViewerImageInfo>, SourceError> {
        let viewer = &self.document.viewer;
        if viewer.unavailable_images.iter().any(|id| id == viewer_id) {
            return Ok(Lookup::Unavailable(format!(
                "viewer image {viewer_id} is unavailable"
            )));
        }
        Ok(match viewer.images.get(viewer_id) {
            Some(body) => Lookup::Found(parse_image_info(viewer_id, body)),
            None => Lookup::Unavailable(format!("http status 404 for image {viewer_id}")),
        })
    }
}

#[async_trait]
impl StorageSource for FixtureSources {
    async fn browse(
        &self,
        dataset: &DatasetRecord,
        folder: &str,
    ) -> Result<Lookup<Vec<StorageFile>>, SourceError> {
        Ok(self
            .document
            .storage
            .folders
            .get(&dataset.id)
            .and_then(|folders| folders.get(folder))
            .map(|body| Lookup::Found(parse_storage_files(body)))
            .unwrap_or(Lookup::NotFound))
    }

    async fn metadata(&self, dataset: &DatasetRecord) -> Result<Lookup<Vec<StorageFile>>, SourceError> {
        Ok(self
            .document
            .storage
            .metadata
            .get(&dataset.id)
            .map(|body| Lookup::Found(parse_storage_files(body)))
            .unwrap_or(Lookup::NotFound))
    }
}

/// Curated, pre-approved name and path discrepancies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideTables {
    /// Viewer display name -> catalog filename.
    #[serde(default)]
    pub name_fixes: BTreeMap<String, String>,
    /// Catalog path -> storage path.
    #[serde(default)]
    pub path_fixes: BTreeMap<String, String>,
}

impl OverrideTables {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing override tables")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Missing file means no known fixes.
    pub fn load_optional(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "override tables not found; treating every discrepancy as unmapped");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn is_known_name(&self, viewer_name: &str) -> bool {
        self.name_fixes.contains_key(viewer_name)
    }

    pub fn is_known_path(&self, catalog_path: &str) -> bool {
        self.path_fixes.contains_key(catalog_path)
    }
}
