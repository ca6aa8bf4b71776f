//! Per-dataset reconciliation and the bounded multi-dataset run loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use imgrecon_core::{
    DatasetRecord, DatasetReport, ImageObject, Lookup, ObjectError, ObjectErrorKind, RunSummary,
    ViewerPermission,
};
use imgrecon_sources::{
    collect_datasets, CatalogSource, FixtureSources, OverrideTables, SourceError, StorageSource,
    ViewerSource,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{build_report, missing_version_error};
use crate::classify::{classify, Classification};
use crate::config::ReconConfig;
use crate::duplicates::{group_duplicates, resolve_group};
use crate::mapping::MappingCache;
use crate::name_match::{check_name, NameCheck};
use crate::path_match::{FetchCache, PathMatcher};

pub const VIEWER_UNAVAILABLE: &str = "Cannot get a valid response from the viewer.";
pub const VIEWER_PERMISSION_DENIED: &str = "Viewer permission denied.";
pub const VIEWER_NAME_MISSING: &str = "Image name cannot be found on the viewer.";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub page_size: usize,
    pub max_datasets: usize,
    pub dataset_concurrency: usize,
    /// Checked before each dataset is dispatched; in-flight datasets finish.
    pub cancel: Arc<AtomicBool>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            page_size: 20,
            max_datasets: 2000,
            dataset_concurrency: 1,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &ReconConfig) -> Self {
        Self {
            page_size: config.page_size,
            max_datasets: config.max_datasets,
            dataset_concurrency: config.dataset_concurrency,
            ..Default::default()
        }
    }
}

/// Collaborators and run-scoped state for one reconciliation run.
#[derive(Clone)]
pub struct Reconciler {
    catalog: Arc<dyn CatalogSource>,
    viewer: Arc<dyn ViewerSource>,
    storage: Arc<dyn StorageSource>,
    mappings: Arc<MappingCache>,
    overrides: Arc<OverrideTables>,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        viewer: Arc<dyn ViewerSource>,
        storage: Arc<dyn StorageSource>,
    ) -> Self {
        Self {
            catalog,
            viewer,
            storage,
            mappings: Arc::new(MappingCache::new()),
            overrides: Arc::new(OverrideTables::default()),
        }
    }

    /// All three collaborators served from one fixture document.
    pub fn from_fixture(fixture: FixtureSources) -> Self {
        let fixture = Arc::new(fixture);
        Self::new(fixture.clone(), fixture.clone(), fixture)
    }

    pub fn with_overrides(mut self, overrides: OverrideTables) -> Self {
        self.overrides = Arc::new(overrides);
        self
    }

    pub fn with_mappings(mut self, mappings: Arc<MappingCache>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn mappings(&self) -> &MappingCache {
        &self.mappings
    }

    /// Reconcile one dataset. Never fails: collaborator trouble ends up in
    /// the report as warnings or object errors.
    pub async fn reconcile_dataset(&self, record: &DatasetRecord) -> DatasetReport {
        if record.version().is_none() {
            warn!(dataset = %record.id, "catalog record has no version; skipping object tests");
            let mut report = DatasetReport::for_dataset(record);
            report.errors.push(missing_version_error());
            return report;
        }

        let listing = match self.viewer.dataset_images(&record.id).await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(dataset = %record.id, error = %err, "viewer dataset listing failed");
                Lookup::Unavailable(err.to_string())
            }
        };
        let classification = classify(&record.objects, &listing);

        let mut cache = FetchCache::new();
        let mut errors = Vec::new();
        for object in unique_objects(&record.objects, &classification) {
            errors.extend(self.test_object(record, object, &mut cache).await);
        }

        let mut unresolved = Vec::new();
        for (viewer_id, members) in group_duplicates(&record.objects, &classification.sets) {
            let mut member_errors = Vec::with_capacity(members.len());
            for member in members {
                member_errors.push(self.test_object(record, member, &mut cache).await);
            }
            let outcome = resolve_group(&record.id, &viewer_id, member_errors, &self.mappings);
            if !outcome.disambiguated() {
                unresolved.push(viewer_id);
            }
            errors.extend(outcome.errors);
        }

        let report = build_report(record, &classification, unresolved, errors);
        info!(
            dataset = %report.id,
            warnings = report.warnings.len(),
            errors = report.errors.len(),
            object_errors = report.object_errors.total,
            viewer_present = report.viewer_present,
            "dataset reconciled"
        );
        report
    }

    /// Per-object test. Unexpected collaborator errors become an object error
    /// so siblings keep going.
    async fn test_object(
        &self,
        record: &DatasetRecord,
        object: &ImageObject,
        cache: &mut FetchCache,
    ) -> Vec<ObjectError> {
        let catalog_path = object.catalog_path();
        let viewer_id = object.viewer_id().unwrap_or_default();
        match self.check_object(record, object, &catalog_path, viewer_id, cache).await {
            Ok(errors) => errors,
            Err(err) => {
                warn!(dataset = %record.id, viewer_id, error = %err, "object test failed");
                vec![ObjectError::new(
                    catalog_path,
                    viewer_id,
                    ObjectErrorKind::Unexpected,
                    err.to_string(),
                )]
            }
        }
    }

    async fn check_object(
        &self,
        record: &DatasetRecord,
        object: &ImageObject,
        catalog_path: &str,
        viewer_id: &str,
        cache: &mut FetchCache,
    ) -> Result<Vec<ObjectError>, SourceError> {
        let bare = |kind, reason: &str| vec![ObjectError::new(catalog_path, viewer_id, kind, reason)];

        let info = match self.viewer.image_info(viewer_id).await? {
            Lookup::Found(info) => info,
            Lookup::NotFound => return Ok(bare(ObjectErrorKind::ViewerUnavailable, VIEWER_UNAVAILABLE)),
            Lookup::Unavailable(reason) => {
                warn!(dataset = %record.id, viewer_id, %reason, "viewer image info unavailable");
                return Ok(bare(ObjectErrorKind::ViewerUnavailable, VIEWER_UNAVAILABLE));
            }
        };
        if info.permission == ViewerPermission::Denied {
            return Ok(bare(ObjectErrorKind::PermissionDenied, VIEWER_PERMISSION_DENIED));
        }
        let Some(display_name) = info.name.as_deref().filter(|name| !name.is_empty()) else {
            return Ok(bare(ObjectErrorKind::ImageNameMissing, VIEWER_NAME_MISSING));
        };

        let mut errors = Vec::new();
        let mut paths = PathMatcher {
            storage: self.storage.as_ref(),
            cache,
            mappings: &self.mappings,
            overrides: &self.overrides,
        };
        errors.extend(paths.check(record, catalog_path, viewer_id).await?);

        let name = NameCheck {
            dataset_id: &record.id,
            viewer_id,
            catalog_path,
            display_name,
            mime: object.mime_class(),
        };
        errors.extend(check_name(&name, &self.mappings, &self.overrides));
        Ok(errors)
    }

    /// Collect catalog datasets and reconcile them with at most
    /// `dataset_concurrency` in flight. Reports keep catalog order.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let mut summary = RunSummary::start(Uuid::new_v4(), Utc::now());
        let page = collect_datasets(self.catalog.as_ref(), options.page_size, options.max_datasets)
            .await
            .context("collecting catalog datasets")?;
        for _ in 0..page.skipped() {
            summary.record_skipped();
        }
        info!(
            run_id = %summary.run_id,
            datasets = page.records.len(),
            skipped = page.skipped(),
            "catalog datasets collected"
        );

        let permits = Arc::new(Semaphore::new(options.dataset_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, record) in page.records.into_iter().enumerate() {
            if options.cancel.load(Ordering::SeqCst) {
                warn!(run_id = %summary.run_id, dispatched = index, "run cancelled; not dispatching further datasets");
                break;
            }
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .context("dataset semaphore closed")?;
            let reconciler = self.clone();
            let span = info_span!("dataset", id = %record.id);
            tasks.spawn(
                async move {
                    let report = reconciler.reconcile_dataset(&record).await;
                    drop(permit);
                    (index, report)
                }
                .instrument(span),
            );
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            reports.push(joined.context("dataset task panicked")?);
        }
        reports.sort_by_key(|(index, _)| *index);
        for (_, report) in reports {
            summary.record(report);
        }

        summary.finish(Utc::now());
        info!(
            run_id = %summary.run_id,
            tested = summary.tested,
            warned = summary.warned,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary)
    }

    /// Reconcile a single dataset looked up by id.
    pub async fn run_dataset(&self, dataset_id: &str) -> Result<RunSummary> {
        let mut summary = RunSummary::start(Uuid::new_v4(), Utc::now());
        let record = self
            .catalog
            .dataset(dataset_id)
            .await
            .with_context(|| format!("looking up dataset {dataset_id}"))?
            .with_context(|| format!("dataset {dataset_id} not found in catalog"))?;
        summary.record(self.reconcile_dataset(&record).await);
        summary.finish(Utc::now());
        Ok(summary)
    }
}

/// Image objects whose identifier is present on both sides exactly once.
fn unique_objects<'a>(
    objects: &'a [ImageObject],
    classification: &'a Classification,
) -> impl Iterator<Item = &'a ImageObject> + 'a {
    objects.iter().filter(move |object| {
        object.mime_class().is_viewer_image()
            && object
                .viewer_id()
                .is_some_and(|id| classification.sets.both_unique.contains(id))
    })
}
