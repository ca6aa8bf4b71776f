//! Run report output and the recent-runs Markdown digest.

use std::path::PathBuf;

use anyhow::{Context, Result};
use imgrecon_core::RunSummary;
use imgrecon_http::ReportStore;
use serde::Serialize;
use tracing::info;

use crate::mapping::{MappingSnapshot, NameMapping};

pub const REPORTS_FILE: &str = "viewer_reports";
pub const NAME_MAPPING_FILE: &str = "viewer_name_mapping";
pub const PATH_MAPPING_FILE: &str = "viewer_path_mapping";

const NAME_MAPPING_NOTE: &str =
    "Replace the viewer image name with the catalog filename. Entries are dataset id -> viewer id -> path -> viewer name -> filename.";

#[derive(Serialize)]
struct NameMappingOutput<'a> {
    note: &'static str,
    mapping: &'a NameMapping,
}

/// Write the run summary and both mapping tables, then the manifest.
pub async fn write_run_reports(
    store: &ReportStore,
    summary: &RunSummary,
    mappings: &MappingSnapshot,
) -> Result<PathBuf> {
    let run_id = summary.run_id;
    let reports = store.write_json(run_id, REPORTS_FILE, summary).await?;
    let names = store
        .write_json(
            run_id,
            NAME_MAPPING_FILE,
            &NameMappingOutput {
                note: NAME_MAPPING_NOTE,
                mapping: &mappings.names,
            },
        )
        .await?;
    let paths = store.write_json(run_id, PATH_MAPPING_FILE, &mappings.paths).await?;

    let manifest = store.write_manifest(run_id, vec![reports, names, paths]).await?;
    info!(%run_id, manifest = %manifest.display(), "run reports written");
    Ok(manifest)
}

pub fn report_recent_markdown(store: &ReportStore, runs: usize) -> Result<String> {
    let mut lines = vec!["# Image Asset Reconciliation".to_string(), String::new()];
    for dir in store.recent_runs(runs)? {
        let reports_path = dir.join(format!("{REPORTS_FILE}.json"));
        if !reports_path.exists() {
            continue;
        }
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&reports_path)
                .with_context(|| format!("reading {}", reports_path.display()))?,
        )
        .with_context(|| format!("parsing {}", reports_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at.to_rfc3339()));
        lines.push(format!(
            "- tested: {} ({} with viewer images)",
            summary.tested, summary.tested_with_viewer
        ));
        lines.push(format!("- warned: {}", summary.warned));
        lines.push(format!("- failed: {}", summary.failed));
        if !summary.failed_ids.is_empty() {
            lines.push(format!("- failed ids: {}", summary.failed_ids.join(", ")));
        }
        let names_path = dir.join(format!("{NAME_MAPPING_FILE}.json"));
        if names_path.exists() {
            lines.push(format!("- name mapping: `{}`", names_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
