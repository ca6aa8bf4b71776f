use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use imgrecon_core::{
    DatasetRecord, DuplicateVerdict, IssueKind, Lookup, MappingStatus, ObjectErrorKind,
    StorageFile, ViewerImageInfo,
};
use imgrecon_engine::{MappingCache, Reconciler, RunOptions};
use imgrecon_sources::{CatalogSource, FixtureSources, SourceError, StorageSource, ViewerSource};
use serde_json::{json, Value as JsonValue};

fn hit(id: u64, version: Option<u64>, objects: JsonValue) -> JsonValue {
    let mut pennsieve = json!({
        "identifier": id,
        "uri": format!("s3://pennsieve-prod-discover-publish-use1/{id}"),
    });
    if let Some(version) = version {
        pennsieve["version"] = json!({ "identifier": version });
    }
    json!({
        "_id": format!("DOI:{id}"),
        "_source": {
            "item": { "name": format!("dataset {id}"), "curie": format!("DOI:10.26275/{id}") },
            "pennsieve": pennsieve,
            "objects": objects,
        }
    })
}

fn image(path: &str, viewer_id: &str) -> JsonValue {
    json!({
        "dataset": { "path": path },
        "biolucida": { "identifier": viewer_id },
        "mimetype": { "name": "image/jp2" },
        "additional_mimetype": "not-specified",
    })
}

fn files(paths: &[&str]) -> JsonValue {
    json!({ "files": paths.iter().map(|p| json!({ "path": p })).collect::<Vec<_>>() })
}

fn viewer_listing(ids: &[&str]) -> JsonValue {
    json!({
        "status": "success",
        "dataset_images": ids.iter().map(|id| json!({ "image_id": id })).collect::<Vec<_>>(),
    })
}

fn named(name: &str) -> JsonValue {
    json!({ "status": "success", "name": name })
}

/// 292: one clean object plus a duplicate pair with one clean member.
/// 300: viewer objects on the catalog, nothing on the viewer.
/// 310: no version. One hit carries no storage identifier at all.
fn mixed_run_fixture() -> FixtureSources {
    FixtureSources::from_value(json!({
        "catalog": [
            hit(292, Some(3), json!([
                image("derivative/sub-1/slide01.jp2", "101"),
                image("derivative/sub-1/slide02.jp2", "202"),
                image("derivative/sub-1/slide02-copy.jp2", "202"),
            ])),
            hit(300, Some(1), json!([ image("primary/scan.jp2", "5") ])),
            hit(310, None, json!([ image("primary/scan.jp2", "6") ])),
            { "_id": "orphan", "_source": { "item": { "name": "no storage id" } } },
        ],
        "viewer": {
            "datasets": { "292": viewer_listing(&["101", "202"]) },
            "images": {
                "101": named("slide01.jp2"),
                "202": named("slide02.jp2"),
            },
        },
        "storage": {
            "folders": {
                "292": {
                    "files/derivative/sub-1": files(&[
                        "files/derivative/sub-1/slide01.jp2",
                        "files/derivative/sub-1/slide02.jp2",
                        "files/derivative/sub-1/slide02-copy.jp2",
                    ]),
                },
            },
        },
    }))
    .expect("fixture")
}

#[tokio::test]
async fn duplicate_with_one_clean_member_reports_only_the_stale_copy() {
    let reconciler = Reconciler::from_fixture(mixed_run_fixture());
    let summary = reconciler.run(&RunOptions::default()).await.expect("run");

    let report = summary
        .failed_datasets
        .iter()
        .find(|r| r.id == "292")
        .expect("292 failed");
    assert!(report.errors.is_empty());
    assert!(report.warnings.is_empty());
    assert_eq!(report.object_errors.total, 1);

    let stale = &report.object_errors.objects[0];
    assert_eq!(stale.catalog_path, "files/derivative/sub-1/slide02-copy.jp2");
    assert_eq!(stale.kind, ObjectErrorKind::NameConflict);
    assert_eq!(stale.duplicate, Some(DuplicateVerdict::CleanUpRequired));

    let inconsistency = report.object_errors.inconsistency.expect("inconsistency");
    assert_eq!(inconsistency.name.map(|n| n.total), Some(1));
    assert_eq!(inconsistency.path, None);

    assert!(!reconciler.mappings().has_name_entry("292", "202"));
    assert!(reconciler.mappings().snapshot().names.is_empty());
}

#[tokio::test]
async fn run_summary_counts_every_catalog_hit() {
    let reconciler = Reconciler::from_fixture(mixed_run_fixture());
    let summary = reconciler.run(&RunOptions::default()).await.expect("run");

    assert_eq!(summary.tested, 4);
    assert_eq!(summary.tested_with_viewer, 2);
    assert_eq!(summary.failed_ids, vec!["292".to_string(), "310".to_string()]);
    assert_eq!(summary.warned_ids, vec!["300".to_string()]);
    assert!(!summary.passed());
    assert!(summary.finished_at.is_some());

    let missing_version = &summary.failed_datasets[1];
    assert_eq!(missing_version.errors.len(), 1);
    assert_eq!(missing_version.errors[0].kind, IssueKind::MissingVersion);
    assert_eq!(missing_version.object_errors.total, 0);
}

#[tokio::test]
async fn objects_without_viewer_images_warn_once() {
    let reconciler = Reconciler::from_fixture(mixed_run_fixture());
    let summary = reconciler.run(&RunOptions::default()).await.expect("run");

    let report = &summary.warned_datasets[0];
    assert_eq!(report.id, "300");
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].kind, IssueKind::ViewerImagesMissing);
    assert!(report.viewer_present);
    assert_eq!(report.object_errors.total, 0);
}

#[tokio::test]
async fn duplicate_with_no_clean_member_is_a_dataset_error() {
    let fixture = FixtureSources::from_value(json!({
        "catalog": [ hit(321, Some(2), json!([
            image("primary/a.jp2", "77"),
            image("primary/b.jp2", "77"),
        ])) ],
        "viewer": {
            "datasets": { "321": viewer_listing(&["77"]) },
            "images": { "77": named("c.jp2") },
        },
        "storage": {
            "folders": { "321": { "files/primary": files(&["files/primary/a.jp2", "files/primary/b.jp2"]) } },
        },
    }))
    .expect("fixture");
    let reconciler = Reconciler::from_fixture(fixture);
    let summary = reconciler.run(&RunOptions::default()).await.expect("run");
    let report = &summary.failed_datasets[0];

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, IssueKind::DuplicateIdentifiers);
    assert_eq!(report.errors[0].ids, vec!["77".to_string()]);
    assert_eq!(report.errors[0].total, Some(1));
    assert_eq!(report.object_errors.total, 2);
    assert!(report
        .object_errors
        .objects
        .iter()
        .all(|e| e.duplicate == Some(DuplicateVerdict::MetadataRequired)));
    assert!(reconciler.mappings().has_name_entry("321", "77"));
}

#[tokio::test]
async fn metadata_path_hit_feeds_the_name_comparison() {
    let fixture = FixtureSources::from_value(json!({
        "catalog": [ hit(400, Some(1), json!([ image("primary/image_1.jp2", "9") ])) ],
        "viewer": {
            "datasets": { "400": viewer_listing(&["9"]) },
            "images": { "9": named("Image 1.jp2") },
        },
        "storage": {
            "folders": { "400": { "files/primary": files(&["files/primary/other.jp2"]) } },
            "metadata": { "400": files(&["files/primary/Image 1.jp2"]) },
        },
    }))
    .expect("fixture");
    let reconciler = Reconciler::from_fixture(fixture);
    let summary = reconciler.run(&RunOptions::default()).await.expect("run");

    let report = &summary.failed_datasets[0];
    assert_eq!(report.object_errors.total, 1);
    let error = &report.object_errors.objects[0];
    assert_eq!(error.kind, ObjectErrorKind::FileNotFound);
    assert_eq!(error.path_mapping, Some(MappingStatus::Required));

    let inconsistency = report.object_errors.inconsistency.expect("inconsistency");
    assert_eq!(inconsistency.path.map(|p| (p.mapped, p.unmapped)), Some((0, 1)));
    assert_eq!(inconsistency.name, None);

    let snapshot = reconciler.mappings().snapshot();
    assert_eq!(
        snapshot.paths["400"]["files/primary/image_1.jp2"],
        "files/primary/Image 1.jp2"
    );
    assert!(snapshot.names.is_empty());
}

#[tokio::test]
async fn viewer_trouble_is_reported_per_object() {
    let fixture = FixtureSources::from_value(json!({
        "catalog": [ hit(500, Some(1), json!([
            image("primary/down.jp2", "1"),
            image("primary/locked.jp2", "2"),
            image("primary/nameless.jp2", "3"),
        ])) ],
        "viewer": {
            "datasets": { "500": viewer_listing(&["1", "2", "3"]) },
            "images": {
                "2": { "status": "permission denied" },
                "3": { "status": "success" },
            },
            "unavailable_images": ["1"],
        },
    }))
    .expect("fixture");
    let record = fixture.dataset("500").await.expect("lookup").expect("record");
    let reconciler = Reconciler::from_fixture(fixture);
    let report = reconciler.reconcile_dataset(&record).await;

    let kinds: Vec<_> = report.object_errors.objects.iter().map(|e| e.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            ObjectErrorKind::ViewerUnavailable,
            ObjectErrorKind::PermissionDenied,
            ObjectErrorKind::ImageNameMissing,
        ]
    );
    assert_eq!(report.object_errors.objects[0].reason, "Cannot get a valid response from the viewer.");
    assert_eq!(report.object_errors.inconsistency, None);
}

/// Storage served from a fixture, except one folder whose listing errors out.
struct BrokenFolderStorage {
    inner: Arc<FixtureSources>,
    broken_folder: &'static str,
}

#[async_trait]
impl StorageSource for BrokenFolderStorage {
    async fn browse(
        &self,
        dataset: &DatasetRecord,
        folder: &str,
    ) -> Result<Lookup<Vec<StorageFile>>, SourceError> {
        if folder == self.broken_folder {
            return Err(SourceError::Message(format!("listing {folder} failed")));
        }
        self.inner.browse(dataset, folder).await
    }

    async fn metadata(&self, dataset: &DatasetRecord) -> Result<Lookup<Vec<StorageFile>>, SourceError> {
        self.inner.metadata(dataset).await
    }
}

/// Viewer served from a fixture, except that dataset listings always error out.
struct ListingDownViewer {
    inner: Arc<FixtureSources>,
}

#[async_trait]
impl ViewerSource for ListingDownViewer {
    async fn dataset_images(&self, _dataset_id: &str) -> Result<Lookup<Vec<String>>, SourceError> {
        Err(SourceError::Message("viewer listing timed out".into()))
    }

    async fn image_info(&self, viewer_id: &str) -> Result<Lookup<ViewerImageInfo>, SourceError> {
        self.inner.image_info(viewer_id).await
    }
}

fn two_folder_fixture() -> Arc<FixtureSources> {
    Arc::new(
        FixtureSources::from_value(json!({
            "catalog": [ hit(600, Some(1), json!([
                image("primary/a.jp2", "1"),
                image("secondary/b.jp2", "2"),
            ])) ],
            "viewer": {
                "datasets": { "600": viewer_listing(&["1", "2"]) },
                "images": {
                    "1": named("a.jp2"),
                    "2": named("B.jp2"),
                },
            },
            "storage": {
                "folders": {
                    "600": {
                        "files/primary": files(&["files/primary/a.jp2"]),
                        "files/secondary": files(&["files/secondary/b.jp2"]),
                    },
                },
            },
        }))
        .expect("fixture"),
    )
}

#[tokio::test]
async fn storage_failure_on_one_object_leaves_siblings_tested() {
    let fixture = two_folder_fixture();
    let record = fixture.dataset("600").await.expect("lookup").expect("record");
    let storage = Arc::new(BrokenFolderStorage {
        inner: fixture.clone(),
        broken_folder: "files/primary",
    });
    let reconciler = Reconciler::new(fixture.clone(), fixture, storage);
    let report = reconciler.reconcile_dataset(&record).await;

    assert_eq!(report.object_errors.total, 2);
    let failed = &report.object_errors.objects[0];
    assert_eq!(failed.catalog_path, "files/primary/a.jp2");
    assert_eq!(failed.kind, ObjectErrorKind::Unexpected);
    assert_eq!(failed.reason, "listing files/primary failed");

    let sibling = &report.object_errors.objects[1];
    assert_eq!(sibling.catalog_path, "files/secondary/b.jp2");
    assert_eq!(sibling.kind, ObjectErrorKind::NameConflict);
    assert!(reconciler.mappings().has_name_entry("600", "2"));
}

#[tokio::test]
async fn failed_viewer_listing_warns_and_tests_nothing() {
    let fixture = two_folder_fixture();
    let record = fixture.dataset("600").await.expect("lookup").expect("record");
    let viewer = Arc::new(ListingDownViewer { inner: fixture.clone() });
    let reconciler = Reconciler::new(fixture.clone(), viewer, fixture);
    let report = reconciler.reconcile_dataset(&record).await;

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].kind, IssueKind::ViewerImagesMissing);
    assert!(report.errors.is_empty());
    assert_eq!(report.object_errors.total, 0);
}

#[tokio::test]
async fn empty_viewer_listing_warns_about_missing_images() {
    let fixture = FixtureSources::from_value(json!({
        "catalog": [ hit(700, Some(1), json!([ image("primary/a.jp2", "1") ])) ],
        "viewer": {
            "datasets": { "700": { "status": "success", "dataset_images": [] } },
        },
    }))
    .expect("fixture");
    let reconciler = Reconciler::from_fixture(fixture);
    let summary = reconciler.run(&RunOptions::default()).await.expect("run");

    let report = &summary.warned_datasets[0];
    let kinds: Vec<_> = report.warnings.iter().map(|w| w.kind.clone()).collect();
    assert_eq!(kinds, vec![IssueKind::ViewerImagesMissing]);
    assert!(report.viewer_present);
    assert_eq!(report.object_errors.total, 0);
}

#[tokio::test]
async fn concurrent_run_keeps_catalog_order_and_shared_mappings() {
    let options = RunOptions {
        dataset_concurrency: 4,
        ..Default::default()
    };
    let mappings = Arc::new(MappingCache::new());
    let reconciler = Reconciler::from_fixture(mixed_run_fixture()).with_mappings(mappings.clone());
    let summary = reconciler.run(&options).await.expect("run");

    assert_eq!(summary.failed_ids, vec!["292".to_string(), "310".to_string()]);
    assert_eq!(summary.tested, 4);
    assert!(mappings.snapshot().names.is_empty());
}

#[tokio::test]
async fn cancelled_run_dispatches_nothing() {
    let options = RunOptions {
        cancel: Arc::new(AtomicBool::new(true)),
        ..Default::default()
    };
    let reconciler = Reconciler::from_fixture(mixed_run_fixture());
    let summary = reconciler.run(&options).await.expect("run");

    assert!(options.cancel.load(Ordering::SeqCst));
    assert_eq!(summary.tested, 1);
    assert!(summary.failed_ids.is_empty());
    assert!(summary.warned_ids.is_empty());
}

#[tokio::test]
async fn bundled_sample_fixture_runs_offline() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/sample.json");
    let reconciler = Reconciler::from_fixture(FixtureSources::load(path).expect("load sample"));
    let summary = reconciler.run(&RunOptions::default()).await.expect("run");

    assert_eq!(summary.tested, 2);
    assert_eq!(summary.failed_ids, vec!["292".to_string()]);
    assert!(summary.warned_ids.is_empty());
}
