//! Remote clients for the public internship listing API.

use std::time::Duration;

use async_trait::async_trait;
use magang_core::{Listing, RegionKey};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "magang-adapters";

pub const DEFAULT_BASE_URL: &str = "https://maganghub.kemnaker.go.id";
pub const LISTINGS_PATH: &str = "/be/v1/api/list/vacancies-aktif";
pub const STATS_PATH: &str = "/be/v1/api/statistik";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build()
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default = "first_page")]
    pub last_page: u32,
    #[serde(default)]
    pub total: u64,
}

fn first_page() -> u32 {
    1
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            current_page: 1,
            last_page: 1,
            total: 0,
        }
    }
}

/// One page of listings plus the pagination metadata reported with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub listings: Vec<Listing>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    data: Vec<Listing>,
    #[serde(default)]
    meta: PageMeta,
}

#[derive(Debug, Default, Deserialize)]
struct PageMeta {
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Error)]
pub enum RemoteFetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response for page {page}: {source}")]
    Decode {
        page: u32,
        #[source]
        source: serde_json::Error,
    },
}

/// Paginated listing endpoint, partitioned by region. Implementations never retry.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(
        &self,
        page: u32,
        page_size: u32,
        region: &RegionKey,
    ) -> Result<ListingPage, RemoteFetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpListingSource {
    client: reqwest::Client,
    url: String,
}

impl HttpListingSource {
    pub fn new(config: &HttpClientConfig) -> Result<Self, RemoteFetchError> {
        Ok(Self {
            client: build_client(config)?,
            url: join_url(&config.base_url, LISTINGS_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_page(
        &self,
        page: u32,
        page_size: u32,
        region: &RegionKey,
    ) -> Result<ListingPage, RemoteFetchError> {
        let page_param = page.to_string();
        let limit_param = page_size.to_string();
        let resp = self
            .client
            .get(&self.url)
            .query(&[
                ("order_direction", "ASC"),
                ("page", page_param.as_str()),
                ("limit", limit_param.as_str()),
                ("kode_provinsi", region.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteFetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        let envelope: PageEnvelope = serde_json::from_slice(&body)
            .map_err(|source| RemoteFetchError::Decode { page, source })?;
        debug!(
            page,
            region = %region,
            listings = envelope.data.len(),
            last_page = envelope.meta.pagination.last_page,
            "fetched listing page"
        );
        Ok(ListingPage {
            listings: envelope.data,
            pagination: envelope.meta.pagination,
        })
    }
}

/// Aggregate platform counters shown alongside the listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformStats {
    #[serde(alias = "total_lowongan")]
    pub vacancies: u64,
    #[serde(alias = "total_perusahaan")]
    pub companies: u64,
    #[serde(alias = "total_kuota")]
    pub quota: u64,
    #[serde(alias = "total_pendaftar")]
    pub applicants: u64,
}

impl Default for PlatformStats {
    fn default() -> Self {
        Self {
            vacancies: 11_000,
            companies: 2_700,
            quota: 26_000,
            applicants: 150_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum StatsFetchError {
    #[error("stats request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("stats endpoint returned http status {0}")]
    HttpStatus(u16),
    #[error("undecodable stats body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct StatsClient {
    client: reqwest::Client,
    url: String,
}

impl StatsClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, StatsFetchError> {
        Ok(Self {
            client: build_client(config)?,
            url: join_url(&config.base_url, STATS_PATH),
        })
    }

    pub async fn fetch(&self) -> Result<PlatformStats, StatsFetchError> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(StatsFetchError::HttpStatus(status.as_u16()));
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Stats from the endpoint, or the built-in defaults when it is unavailable.
    pub async fn fetch_or_default(&self) -> PlatformStats {
        match self.fetch().await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "stats unavailable; using defaults");
                PlatformStats::default()
            }
        }
    }
}
