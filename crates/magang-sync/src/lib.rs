//! Region fetch orchestration, environment configuration and dataset export.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use magang_adapters::{
    HttpClientConfig, HttpListingSource, RemoteFetchError, StatsClient, DEFAULT_BASE_URL,
};
use magang_core::RegionKey;
use magang_storage::{FileSnapshotStore, SavedJobsStore, SessionStore, StorageError};
use thiserror::Error;

mod export;
mod orchestrator;

pub use export::{export_parquet, ExportManifest, ExportManifestFile, LISTINGS_FILE, MANIFEST_FILE};
pub use orchestrator::{
    DatasetSource, DatasetView, FetchConfig, FetchMode, FetchOrchestrator, FetchOutcome,
    FetchProgress, FetchReport, Pacer, RetryOutcome, RetryReport, TokioPacer,
};

pub const CRATE_NAME: &str = "magang-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no region is active")]
    NoActiveRegion,
    #[error("a fetch is already in progress")]
    FetchInProgress,
    #[error("first page for region {region} failed: {source}")]
    FirstPage {
        region: RegionKey,
        #[source]
        source: RemoteFetchError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub data_dir: PathBuf,
    pub page_size: u32,
    pub page_delay: Duration,
    pub failure_backoff: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub default_region: RegionKey,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let fetch = FetchConfig::default();
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            data_dir: PathBuf::from("./data"),
            page_size: fetch.page_size,
            page_delay: fetch.page_delay,
            failure_backoff: fetch.failure_backoff,
            user_agent: "magang-bot/0.1".to_string(),
            http_timeout_secs: 20,
            default_region: RegionKey::new("31"),
            web_port: 8000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: std::env::var("MAGANG_API_BASE_URL")
                .unwrap_or(defaults.api_base_url),
            data_dir: std::env::var("MAGANG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            page_size: env_parse::<u32>("MAGANG_PAGE_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.page_size),
            page_delay: env_parse("MAGANG_PAGE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_delay),
            failure_backoff: env_parse("MAGANG_FAILURE_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.failure_backoff),
            user_agent: std::env::var("MAGANG_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("MAGANG_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            default_region: std::env::var("MAGANG_DEFAULT_REGION")
                .map(RegionKey::new)
                .unwrap_or(defaults.default_region),
            web_port: env_parse("MAGANG_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            page_size: self.page_size,
            page_delay: self.page_delay,
            failure_backoff: self.failure_backoff,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn snapshot_store(&self) -> FileSnapshotStore {
        FileSnapshotStore::new(self.data_dir.clone())
    }

    pub fn saved_jobs_store(&self) -> SavedJobsStore {
        SavedJobsStore::new(&self.data_dir)
    }

    pub fn session_store(&self) -> SessionStore {
        SessionStore::new(&self.data_dir)
    }

    pub fn stats_client(&self) -> Result<StatsClient> {
        StatsClient::new(&self.http_config()).context("building stats client")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }
}

/// Orchestrator wired to the live remote API and the file-backed snapshot store.
pub fn build_orchestrator(config: &SyncConfig) -> Result<Arc<FetchOrchestrator>> {
    let source =
        HttpListingSource::new(&config.http_config()).context("building listing client")?;
    Ok(Arc::new(FetchOrchestrator::new(
        Arc::new(source),
        Arc::new(config.snapshot_store()),
        Arc::new(TokioPacer),
        config.fetch_config(),
    )))
}
