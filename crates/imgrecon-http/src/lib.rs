//! HTTP fetch utilities and run-report storage for imgrecon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "imgrecon-http";

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct StoredReport {
    pub name: String,
    pub relative_path: PathBuf,
    #[serde(skip)]
    pub absolute_path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub run_id: Uuid,
    pub written_at: DateTime<Utc>,
    pub files: Vec<StoredReport>,
}

/// Per-run report directory: `<root>/<run_id>/<name>.json`.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Serialize `value` as pretty JSON and write it via temp-file rename.
    pub async fn write_json<T: Serialize>(
        &self,
        run_id: Uuid,
        name: &str,
        value: &T,
    ) -> anyhow::Result<StoredReport> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing report {name}"))?;
        let relative_path = PathBuf::from(run_id.to_string()).join(format!("{name}.json"));
        let absolute_path = self.root.join(&relative_path);
        write_atomically(&absolute_path, &bytes).await?;

        Ok(StoredReport {
            name: name.to_string(),
            relative_path,
            absolute_path,
            sha256: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
        })
    }

    pub async fn write_manifest(
        &self,
        run_id: Uuid,
        files: Vec<StoredReport>,
    ) -> anyhow::Result<PathBuf> {
        let manifest = ReportManifest {
            run_id,
            written_at: Utc::now(),
            files,
        };
        let path = self.run_dir(run_id).join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        write_atomically(&path, &bytes).await?;
        Ok(path)
    }

    /// Run directories, most recently modified first.
    pub fn recent_runs(&self, limit: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut dirs = std::fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .collect::<Vec<_>>();
        dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
        dirs.reverse();
        Ok(dirs.into_iter().take(limit.max(1)).map(|e| e.path()).collect())
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("report path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating report directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp report {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_service_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_service_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Shared JSON client with a global and a per-service concurrency limit.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_service_limit: usize,
    per_service: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_service_limit: config.per_service_concurrency.max(1),
            per_service: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_service_semaphore(&self, service: &str) -> Arc<Semaphore> {
        let mut map = self.per_service.lock().await;
        map.entry(service.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_service_limit)))
            .clone()
    }

    pub async fn get_json(
        &self,
        service: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        self.send_json(service, url, |client| client.get(url).query(query))
            .await
    }

    pub async fn post_json(
        &self,
        service: &str,
        url: &str,
        query: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        self.send_json(service, url, |client| {
            client
                .post(url)
                .query(query)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(body)
        })
        .await
    }

    async fn send_json<F>(&self, service: &str, url: &str, build: F) -> Result<JsonValue, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_service = self.per_service_semaphore(service).await;
        let _service = per_service.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", service, url);
        self.send_with_retries(url, build).instrument(span).await
    }

    async fn send_with_retries<F>(&self, url: &str, build: F) -> Result<JsonValue, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                            url: final_url,
                            source,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after server status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Join a base url and a path without doubling or dropping the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
