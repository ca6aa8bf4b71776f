use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub catalog_host: String,
    pub catalog_api_key: String,
    pub storage_host: String,
    pub viewer_endpoint: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_size: usize,
    pub max_datasets: usize,
    pub dataset_concurrency: usize,
    pub reports_dir: PathBuf,
    pub overrides_path: PathBuf,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ReconConfig {
    pub fn from_env() -> Self {
        Self {
            catalog_host: env_or("CATALOG_API_HOST", "http://localhost:9200/datasets"),
            catalog_api_key: env_or("CATALOG_API_KEY", ""),
            storage_host: env_or("STORAGE_API_HOST", "http://localhost:8081/discover"),
            viewer_endpoint: env_or("VIEWER_ENDPOINT", "http://localhost:8082/api/v1"),
            user_agent: env_or("IMGRECON_USER_AGENT", "imgrecon/0.1"),
            http_timeout_secs: env_parsed("IMGRECON_HTTP_TIMEOUT_SECS", 20),
            page_size: env_parsed("IMGRECON_PAGE_SIZE", 20),
            max_datasets: env_parsed("IMGRECON_MAX_DATASETS", 2000),
            dataset_concurrency: env_parsed("IMGRECON_DATASET_CONCURRENCY", 1),
            reports_dir: std::env::var("IMGRECON_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            overrides_path: std::env::var("IMGRECON_OVERRIDES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./overrides.yaml")),
        }
    }
}
