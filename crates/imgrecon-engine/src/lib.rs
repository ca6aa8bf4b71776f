//! Cross-source reconciliation of viewer image metadata.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use imgrecon_http::{HttpClientConfig, HttpFetcher, ReportStore};
use imgrecon_sources::{HttpCatalog, HttpStorage, HttpViewer, OverrideTables};

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod duplicates;
pub mod mapping;
pub mod name_match;
pub mod path_match;
pub mod persist;
pub mod pipeline;

pub use classify::{classify, Classification, IdentifierSets};
pub use config::ReconConfig;
pub use mapping::{MappingCache, MappingSnapshot};
pub use persist::{report_recent_markdown, write_run_reports};
pub use pipeline::{Reconciler, RunOptions};

pub const CRATE_NAME: &str = "imgrecon-engine";

/// Reconciler wired to the live catalog, viewer and storage services.
pub fn build_http_reconciler(config: &ReconConfig) -> Result<Reconciler> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);
    let overrides = OverrideTables::load_optional(&config.overrides_path)
        .with_context(|| format!("loading overrides {}", config.overrides_path.display()))?;

    Ok(Reconciler::new(
        Arc::new(HttpCatalog::new(
            http.clone(),
            config.catalog_host.clone(),
            config.catalog_api_key.clone(),
        )),
        Arc::new(HttpViewer::new(http.clone(), config.viewer_endpoint.clone())),
        Arc::new(HttpStorage::new(http, config.storage_host.clone())),
    )
    .with_overrides(overrides))
}

/// One full run against the live services, with reports written to disk.
pub async fn run_once_from_env() -> Result<imgrecon_core::RunSummary> {
    let config = ReconConfig::from_env();
    let reconciler = build_http_reconciler(&config)?;
    let summary = reconciler.run(&RunOptions::from_config(&config)).await?;
    let store = ReportStore::new(config.reports_dir.clone());
    write_run_reports(&store, &summary, &reconciler.mappings().snapshot()).await?;
    Ok(summary)
}
