//! Sequential, cancellable region fetch with snapshot caching and failed-page retry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use magang_adapters::ListingSource;
use magang_core::{Listing, RegionKey};
use magang_storage::SnapshotStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncError;

/// Suspension used for throttling between page requests.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub page_size: u32,
    /// Pause after a page succeeds.
    pub page_delay: Duration,
    /// Pause after a page fails.
    pub failure_backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            page_delay: Duration::from_millis(300),
            failure_backoff: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchProgress {
    pub current_page: u32,
    pub total_pages: u32,
    pub scanning: bool,
    pub background: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSource {
    Cache,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchReport {
    pub run_id: Uuid,
    pub region: RegionKey,
    pub source: DatasetSource,
    pub listings: usize,
    pub total_pages: u32,
    pub failed_pages: Vec<u32>,
    pub synced_at: Option<DateTime<Utc>>,
    /// Non-fatal partial-failure message.
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    Completed(FetchReport),
    /// Superseded by a newer invocation; nothing was persisted.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryReport {
    pub recovered: Vec<u32>,
    pub still_failed: Vec<u32>,
    pub persisted: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    Completed(RetryReport),
    Cancelled,
}

/// Observable state of the active region's dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetView {
    pub region: Option<RegionKey>,
    pub listings: Vec<Listing>,
    pub progress: FetchProgress,
    pub failed_pages: Vec<u32>,
    pub error: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    pub total_pages: u32,
}

/// Drives page-by-page region fetches against a [`ListingSource`], caching
/// results in a [`SnapshotStore`].
///
/// At most one invocation is live: starting a load, manual sync or retry
/// cancels whatever was running before it. A cancelled invocation stops at
/// its next check and never mutates the dataset or writes a snapshot.
pub struct FetchOrchestrator {
    source: Arc<dyn ListingSource>,
    store: Arc<dyn SnapshotStore>,
    pacer: Arc<dyn Pacer>,
    config: FetchConfig,
    state: RwLock<DatasetView>,
    active: Mutex<Option<CancellationToken>>,
}

impl FetchOrchestrator {
    pub fn new(
        source: Arc<dyn ListingSource>,
        store: Arc<dyn SnapshotStore>,
        pacer: Arc<dyn Pacer>,
        config: FetchConfig,
    ) -> Self {
        Self {
            source,
            store,
            pacer,
            config,
            state: RwLock::new(DatasetView::default()),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Owned copy of the current dataset state.
    pub async fn view(&self) -> DatasetView {
        self.state.read().await.clone()
    }

    /// Borrow the current dataset state without copying the listings.
    pub async fn with_view<R>(&self, f: impl FnOnce(&DatasetView) -> R) -> R {
        f(&*self.state.read().await)
    }

    pub async fn active_region(&self) -> Option<RegionKey> {
        self.state.read().await.region.clone()
    }

    /// Cancel the running invocation and register a fresh token. Callers hold
    /// the state write lock so the swap and their dataset change are one step.
    fn supersede(active: &mut Option<CancellationToken>) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = active.replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Start a load: cancel the running invocation and point the dataset at
    /// `region`. Lock order is always `active` then `state`.
    async fn begin_load(&self, region: &RegionKey, mode: FetchMode) -> CancellationToken {
        let mut active = self.active.lock().await;
        let mut state = self.state.write().await;
        let token = Self::supersede(&mut active);
        *state = DatasetView {
            region: Some(region.clone()),
            progress: FetchProgress {
                background: mode == FetchMode::Background,
                ..FetchProgress::default()
            },
            ..DatasetView::default()
        };
        token
    }

    /// Apply `f` to the dataset while `token` is live and the dataset still
    /// belongs to `region`. Both checks run under the write lock.
    async fn mutate<R>(
        &self,
        token: &CancellationToken,
        region: &RegionKey,
        f: impl FnOnce(&mut DatasetView) -> R,
    ) -> Option<R> {
        let mut state = self.state.write().await;
        if !is_current(&state, token, region) {
            return None;
        }
        Some(f(&mut state))
    }

    /// Write `listings` as the snapshot for `region` and apply `finish`, both
    /// under the state write lock after the same checks as [`mutate`](Self::mutate).
    /// `finish` receives the capture time, or `None` when the write failed.
    async fn persist<R>(
        &self,
        token: &CancellationToken,
        region: &RegionKey,
        listings: &[Listing],
        total_pages: u32,
        finish: impl FnOnce(&mut DatasetView, Option<DateTime<Utc>>) -> R,
    ) -> Option<R> {
        let mut state = self.state.write().await;
        if !is_current(&state, token, region) {
            return None;
        }
        let captured_at = match self.store.put(region, listings, total_pages).await {
            Ok(captured_at) => Some(captured_at),
            Err(err) => {
                warn!(error = %err, "snapshot write failed; keeping in-memory data");
                None
            }
        };
        Some(finish(&mut state, captured_at))
    }

    /// Populate the dataset for `region`, from the snapshot store when a
    /// non-empty snapshot exists and `force_refresh` is false, otherwise by
    /// walking every remote page.
    pub async fn load_region(
        &self,
        region: RegionKey,
        mode: FetchMode,
        force_refresh: bool,
    ) -> Result<FetchOutcome, SyncError> {
        let token = self.begin_load(&region, mode).await;
        let run_id = Uuid::new_v4();
        let span = info_span!("region_fetch", %run_id, region = %region, force_refresh);
        self.fetch_region(token, run_id, region, force_refresh)
            .instrument(span)
            .await
    }

    /// Like [`load_region`](Self::load_region) but runs on a spawned task with
    /// the background flag set. Any previous invocation is cancelled and the
    /// dataset already points at `region` when this returns.
    pub async fn spawn_load(
        self: &Arc<Self>,
        region: RegionKey,
        force_refresh: bool,
    ) -> JoinHandle<Result<FetchOutcome, SyncError>> {
        let token = self.begin_load(&region, FetchMode::Background).await;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let run_id = Uuid::new_v4();
            let span = info_span!("region_fetch", %run_id, region = %region, force_refresh);
            this.fetch_region(token, run_id, region, force_refresh)
                .instrument(span)
                .await
        })
    }

    /// Force-refresh the active region, ignoring any stored snapshot.
    pub async fn manual_sync(&self, mode: FetchMode) -> Result<FetchOutcome, SyncError> {
        let region = self.active_region().await.ok_or(SyncError::NoActiveRegion)?;
        self.load_region(region, mode, true).await
    }

    async fn fetch_region(
        &self,
        token: CancellationToken,
        run_id: Uuid,
        region: RegionKey,
        force_refresh: bool,
    ) -> Result<FetchOutcome, SyncError> {
        if !force_refresh {
            let cached = self.store.get(&region).await;
            if token.is_cancelled() {
                return Ok(FetchOutcome::Cancelled);
            }
            match cached {
                Ok(Some(snapshot)) if !snapshot.listings.is_empty() => {
                    let report = FetchReport {
                        run_id,
                        region: region.clone(),
                        source: DatasetSource::Cache,
                        listings: snapshot.listings.len(),
                        total_pages: snapshot.total_pages,
                        failed_pages: Vec::new(),
                        synced_at: Some(snapshot.captured_at),
                        warning: None,
                    };
                    let applied = self
                        .mutate(&token, &region, |state| {
                            state.listings = snapshot.listings;
                            state.total_pages = snapshot.total_pages;
                            state.last_synced = Some(snapshot.captured_at);
                            state.progress = FetchProgress::default();
                        })
                        .await;
                    if applied.is_none() {
                        return Ok(FetchOutcome::Cancelled);
                    }
                    info!(listings = report.listings, "serving cached snapshot");
                    return Ok(FetchOutcome::Completed(report));
                }
                Ok(_) => debug!("no usable snapshot; fetching from remote"),
                Err(err) => warn!(error = %err, "snapshot read failed; treating as cache miss"),
            }
        }

        let page_size = self.config.page_size;
        let scanning = self
            .mutate(&token, &region, |state| state.progress.scanning = true)
            .await;
        if scanning.is_none() {
            return Ok(FetchOutcome::Cancelled);
        }

        let first = self.source.fetch_page(1, page_size, &region).await;
        if token.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        let first = match first {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "first page failed");
                let message = format!("Failed to load listings for region {region}: {err}");
                let recorded = self
                    .mutate(&token, &region, |state| {
                        state.error = Some(message);
                        state.progress = FetchProgress::default();
                    })
                    .await;
                if recorded.is_none() {
                    return Ok(FetchOutcome::Cancelled);
                }
                return Err(SyncError::FirstPage {
                    region,
                    source: err,
                });
            }
        };

        let total_pages = first.pagination.last_page.max(1);
        let mut accumulated = first.listings;
        let appended = self
            .mutate(&token, &region, |state| {
                state.listings.extend(accumulated.iter().cloned());
                state.total_pages = total_pages;
                state.progress.current_page = 1;
                state.progress.total_pages = total_pages;
            })
            .await;
        if appended.is_none() {
            return Ok(FetchOutcome::Cancelled);
        }
        info!(total_pages, "first page loaded");

        let mut failed_pages = Vec::new();
        for page in 2..=total_pages {
            if token.is_cancelled() {
                return Ok(FetchOutcome::Cancelled);
            }
            let result = self.source.fetch_page(page, page_size, &region).await;
            if token.is_cancelled() {
                return Ok(FetchOutcome::Cancelled);
            }

            match result {
                Ok(fetched) => {
                    let applied = self
                        .mutate(&token, &region, |state| {
                            state.listings.extend(fetched.listings.iter().cloned());
                            state.progress.current_page = page;
                        })
                        .await;
                    if applied.is_none() {
                        return Ok(FetchOutcome::Cancelled);
                    }
                    accumulated.extend(fetched.listings);
                    debug!(page, total_pages, "page loaded");
                    self.pacer.pause(self.config.page_delay).await;
                }
                Err(err) => {
                    warn!(page, error = %err, "page failed; continuing");
                    failed_pages.push(page);
                    let recorded = self
                        .mutate(&token, &region, |state| state.failed_pages.push(page))
                        .await;
                    if recorded.is_none() {
                        return Ok(FetchOutcome::Cancelled);
                    }
                    self.pacer.pause(self.config.failure_backoff).await;
                }
            }
        }

        let warning = (!failed_pages.is_empty()).then(|| {
            format!(
                "{} of {} pages failed to load; showing partial results",
                failed_pages.len(),
                total_pages
            )
        });
        let finished = self
            .persist(&token, &region, &accumulated, total_pages, |state, captured_at| {
                let synced_at = captured_at.unwrap_or_else(Utc::now);
                state.progress = FetchProgress::default();
                state.last_synced = Some(synced_at);
                state.failed_pages = failed_pages.clone();
                state.error = warning.clone();
                synced_at
            })
            .await;
        let Some(synced_at) = finished else {
            return Ok(FetchOutcome::Cancelled);
        };

        info!(
            listings = accumulated.len(),
            failed = failed_pages.len(),
            "region fetch finished"
        );
        Ok(FetchOutcome::Completed(FetchReport {
            run_id,
            region,
            source: DatasetSource::Remote,
            listings: accumulated.len(),
            total_pages,
            failed_pages,
            synced_at: Some(synced_at),
            warning,
        }))
    }

    /// Re-request only the pages that failed during the most recent fetch.
    ///
    /// When every page recovers, the grown dataset is persisted with a page
    /// count recomputed from its size. A retry superseded by a region switch
    /// or a newer load ends as [`RetryOutcome::Cancelled`] without touching
    /// the dataset or any snapshot.
    pub async fn retry_failed(&self) -> Result<RetryOutcome, SyncError> {
        let (token, region, pending, base) = {
            let mut active = self.active.lock().await;
            let mut state = self.state.write().await;
            if state.progress.scanning {
                return Err(SyncError::FetchInProgress);
            }
            let region = state.region.clone().ok_or(SyncError::NoActiveRegion)?;
            if state.failed_pages.is_empty() {
                return Ok(RetryOutcome::Completed(RetryReport::default()));
            }
            let token = Self::supersede(&mut active);
            let pending = std::mem::take(&mut state.failed_pages);
            state.progress = FetchProgress {
                current_page: 0,
                total_pages: u32::try_from(pending.len()).unwrap_or(u32::MAX),
                scanning: true,
                background: false,
            };
            (token, region, pending, state.listings.clone())
        };

        let span = info_span!("retry_failed", region = %region, pages = pending.len());
        self.retry_pages(token, region, pending, base)
            .instrument(span)
            .await
    }

    async fn retry_pages(
        &self,
        token: CancellationToken,
        region: RegionKey,
        pending: Vec<u32>,
        mut listings: Vec<Listing>,
    ) -> Result<RetryOutcome, SyncError> {
        let mut known = listings
            .iter()
            .map(|l| l.id.clone())
            .collect::<HashSet<_>>();
        let mut recovered = Vec::new();
        let mut still_failed = Vec::new();
        for (index, page) in pending.into_iter().enumerate() {
            if token.is_cancelled() {
                return Ok(RetryOutcome::Cancelled);
            }
            let result = self
                .source
                .fetch_page(page, self.config.page_size, &region)
                .await;
            if token.is_cancelled() {
                return Ok(RetryOutcome::Cancelled);
            }
            let attempted = u32::try_from(index + 1).unwrap_or(u32::MAX);

            match result {
                Ok(fetched) => {
                    let fresh = fetched
                        .listings
                        .into_iter()
                        .filter(|l| known.insert(l.id.clone()))
                        .collect::<Vec<_>>();
                    let applied = self
                        .mutate(&token, &region, |state| {
                            state.listings.extend(fresh.iter().cloned());
                            state.progress.current_page = attempted;
                        })
                        .await;
                    if applied.is_none() {
                        return Ok(RetryOutcome::Cancelled);
                    }
                    listings.extend(fresh);
                    recovered.push(page);
                }
                Err(err) => {
                    warn!(page, error = %err, "retry failed");
                    still_failed.push(page);
                    let recorded = self
                        .mutate(&token, &region, |state| {
                            state.failed_pages.push(page);
                            state.progress.current_page = attempted;
                        })
                        .await;
                    if recorded.is_none() {
                        return Ok(RetryOutcome::Cancelled);
                    }
                    self.pacer.pause(self.config.failure_backoff).await;
                }
            }
        }

        if !still_failed.is_empty() {
            let message = format!(
                "Recovered {} page(s); {} page(s) still failing",
                recovered.len(),
                still_failed.len()
            );
            let finished = self
                .mutate(&token, &region, |state| {
                    state.progress = FetchProgress::default();
                    state.error = Some(message.clone());
                })
                .await;
            if finished.is_none() {
                return Ok(RetryOutcome::Cancelled);
            }
            return Ok(RetryOutcome::Completed(RetryReport {
                recovered,
                still_failed,
                persisted: false,
                message: Some(message),
            }));
        }

        let page_size = self.config.page_size.max(1);
        let total_pages = u32::try_from(listings.len())
            .unwrap_or(u32::MAX)
            .div_ceil(page_size)
            .max(1);
        let persisted = self
            .persist(&token, &region, &listings, total_pages, |state, captured_at| {
                state.progress = FetchProgress::default();
                state.error = None;
                state.total_pages = total_pages;
                state.last_synced = Some(captured_at.unwrap_or_else(Utc::now));
                captured_at.is_some()
            })
            .await;
        let Some(persisted) = persisted else {
            return Ok(RetryOutcome::Cancelled);
        };
        info!(recovered = recovered.len(), "all failed pages recovered");
        Ok(RetryOutcome::Completed(RetryReport {
            recovered,
            still_failed,
            persisted,
            message: None,
        }))
    }

    /// Drop every stored snapshot. The in-memory dataset is left as is.
    pub async fn clear_cache(&self) -> Result<(), SyncError> {
        self.store.clear().await?;
        Ok(())
    }
}

fn is_current(state: &DatasetView, token: &CancellationToken, region: &RegionKey) -> bool {
    !token.is_cancelled() && state.region.as_ref() == Some(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use magang_adapters::{ListingPage, Pagination, RemoteFetchError};
    use magang_core::Employer;
    use magang_storage::{MemorySnapshotStore, StorageError};
    use tokio::sync::Notify;

    fn listing(id: &str) -> Listing {
        Listing {
            id: id.to_string(),
            title: format!("Posisi {id}"),
            description: String::new(),
            program_studies_raw: "[]".to_string(),
            education_levels_raw: r#"["S1"]"#.to_string(),
            quota: 1,
            registered: 0,
            employer: Employer {
                name: "PT Uji".to_string(),
                city: "KOTA SURABAYA".to_string(),
                province: "JAWA TIMUR".to_string(),
                ..Default::default()
            },
            schedule: Default::default(),
            status: None,
        }
    }

    fn page_listings(region: &RegionKey, page: u32) -> Vec<Listing> {
        (0..3)
            .map(|i| listing(&format!("{}-{page}-{i}", region.as_str())))
            .collect()
    }

    type Gate = (RegionKey, u32, Arc<Notify>, Arc<Notify>);

    /// Serves `total_pages` pages of three listings each; pages in `failing`
    /// return an error until removed.
    struct ScriptedSource {
        total_pages: u32,
        failing: std::sync::Mutex<BTreeSet<u32>>,
        calls: std::sync::Mutex<Vec<(String, u32)>>,
        gate: std::sync::Mutex<Option<Gate>>,
    }

    impl ScriptedSource {
        fn new(total_pages: u32, failing: &[u32]) -> Self {
            Self {
                total_pages,
                failing: std::sync::Mutex::new(failing.iter().copied().collect()),
                calls: std::sync::Mutex::new(Vec::new()),
                gate: std::sync::Mutex::new(None),
            }
        }

        /// Park the next request for `page` of `region` until `release` is
        /// notified. Returns `(reached, release)`.
        fn gate(&self, region: &RegionKey, page: u32) -> (Arc<Notify>, Arc<Notify>) {
            let reached = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            *self.gate.lock().unwrap() =
                Some((region.clone(), page, reached.clone(), release.clone()));
            (reached, release)
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }

        fn heal(&self, page: u32) {
            self.failing.lock().unwrap().remove(&page);
        }
    }

    #[async_trait]
    impl ListingSource for ScriptedSource {
        async fn fetch_page(
            &self,
            page: u32,
            _page_size: u32,
            region: &RegionKey,
        ) -> Result<ListingPage, RemoteFetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((region.as_str().to_string(), page));
            let gate = {
                let mut gate = self.gate.lock().unwrap();
                match gate.as_ref() {
                    Some((r, p, _, _)) if r == region && *p == page => gate.take(),
                    _ => None,
                }
            };
            if let Some((_, _, reached, release)) = gate {
                reached.notify_one();
                release.notified().await;
            }
            if self.failing.lock().unwrap().contains(&page) {
                return Err(RemoteFetchError::HttpStatus {
                    status: 503,
                    url: format!("https://listings.test/vacancies?page={page}"),
                });
            }
            Ok(ListingPage {
                listings: page_listings(region, page),
                pagination: Pagination {
                    current_page: page,
                    last_page: self.total_pages,
                    total: u64::from(self.total_pages) * 3,
                },
            })
        }
    }

    #[derive(Default)]
    struct RecordingPacer {
        delays: std::sync::Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Pacer for RecordingPacer {
        async fn pause(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }

    /// Snapshot store whose reads and/or writes always fail.
    struct BrokenStore {
        inner: MemorySnapshotStore,
        fail_reads: bool,
        fail_writes: bool,
    }

    fn unavailable() -> StorageError {
        StorageError::Io {
            path: "snapshots".into(),
            source: std::io::Error::other("storage unavailable"),
        }
    }

    #[async_trait]
    impl SnapshotStore for BrokenStore {
        async fn get(&self, region: &RegionKey) -> Result<Option<magang_core::Snapshot>, StorageError> {
            if self.fail_reads {
                return Err(unavailable());
            }
            self.inner.get(region).await
        }

        async fn put(
            &self,
            region: &RegionKey,
            listings: &[Listing],
            total_pages: u32,
        ) -> Result<DateTime<Utc>, StorageError> {
            if self.fail_writes {
                return Err(unavailable());
            }
            self.inner.put(region, listings, total_pages).await
        }

        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }
    }

    fn config() -> FetchConfig {
        FetchConfig {
            page_size: 3,
            page_delay: Duration::from_millis(10),
            failure_backoff: Duration::from_millis(50),
        }
    }

    fn orchestrator(
        source: Arc<ScriptedSource>,
        store: Arc<dyn SnapshotStore>,
        pacer: Arc<RecordingPacer>,
    ) -> Arc<FetchOrchestrator> {
        Arc::new(FetchOrchestrator::new(source, store, pacer, config()))
    }

    fn ids(listings: &[Listing]) -> Vec<String> {
        listings.iter().map(|l| l.id.clone()).collect()
    }

    fn expected_ids(region: &RegionKey, pages: &[u32]) -> Vec<String> {
        pages
            .iter()
            .flat_map(|p| ids(&page_listings(region, *p)))
            .collect()
    }

    fn completed(outcome: FetchOutcome) -> FetchReport {
        match outcome {
            FetchOutcome::Completed(report) => report,
            FetchOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn non_empty_snapshot_short_circuits_remote() {
        let region = RegionKey::new("35");
        let store = Arc::new(MemorySnapshotStore::new());
        let cached = vec![listing("cached-1"), listing("cached-2")];
        let captured_at = store.put(&region, &cached, 4).await.unwrap();

        let source = Arc::new(ScriptedSource::new(5, &[]));
        let orch = orchestrator(source.clone(), store, Arc::default());
        let report = completed(
            orch.load_region(region.clone(), FetchMode::Foreground, false)
                .await
                .unwrap(),
        );

        assert!(source.calls().is_empty());
        assert_eq!(report.source, DatasetSource::Cache);
        let view = orch.view().await;
        assert_eq!(view.listings, cached);
        assert_eq!(view.last_synced, Some(captured_at));
        assert_eq!(view.total_pages, 4);
        assert_eq!(view.progress, FetchProgress::default());
    }

    #[tokio::test]
    async fn empty_snapshot_counts_as_miss() {
        let region = RegionKey::new("35");
        let store = Arc::new(MemorySnapshotStore::new());
        store.put(&region, &[], 1).await.unwrap();

        let source = Arc::new(ScriptedSource::new(1, &[]));
        let orch = orchestrator(source.clone(), store, Arc::default());
        let report = completed(
            orch.load_region(region, FetchMode::Foreground, false)
                .await
                .unwrap(),
        );
        assert_eq!(report.source, DatasetSource::Remote);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_pages_are_recorded_and_loop_continues() {
        let region = RegionKey::new("32");
        let store = Arc::new(MemorySnapshotStore::new());
        let source = Arc::new(ScriptedSource::new(6, &[2, 5]));
        let pacer = Arc::new(RecordingPacer::default());
        let orch = orchestrator(source.clone(), store.clone(), pacer.clone());

        let report = completed(
            orch.load_region(region.clone(), FetchMode::Foreground, false)
                .await
                .unwrap(),
        );

        assert_eq!(report.failed_pages, vec![2, 5]);
        assert_eq!(report.total_pages, 6);
        assert!(report.warning.as_deref().unwrap().contains("2 of 6 pages"));
        let pages = source.calls().into_iter().map(|(_, p)| p).collect::<Vec<_>>();
        assert_eq!(pages, vec![1, 2, 3, 4, 5, 6]);

        let view = orch.view().await;
        assert_eq!(view.failed_pages, vec![2, 5]);
        assert_eq!(ids(&view.listings), expected_ids(&region, &[1, 3, 4, 6]));
        assert!(view.error.is_some());
        assert!(!view.progress.scanning);

        let snapshot = store.get(&region).await.unwrap().unwrap();
        assert_eq!(ids(&snapshot.listings), expected_ids(&region, &[1, 3, 4, 6]));
        assert_eq!(snapshot.total_pages, 6);

        let fast = config().page_delay;
        let slow = config().failure_backoff;
        assert_eq!(*pacer.delays.lock().unwrap(), vec![slow, fast, fast, slow, fast]);
    }

    #[tokio::test]
    async fn retry_recovers_some_pages_then_all() {
        let region = RegionKey::new("32");
        let store = Arc::new(MemorySnapshotStore::new());
        let source = Arc::new(ScriptedSource::new(6, &[2, 5]));
        let orch = orchestrator(source.clone(), store.clone(), Arc::default());
        orch.load_region(region.clone(), FetchMode::Foreground, false)
            .await
            .unwrap();

        source.heal(2);
        let RetryOutcome::Completed(first) = orch.retry_failed().await.unwrap() else {
            panic!("retry cancelled");
        };
        assert_eq!(first.recovered, vec![2]);
        assert_eq!(first.still_failed, vec![5]);
        assert!(!first.persisted);
        assert!(first.message.as_deref().unwrap().contains("1 page(s) still failing"));

        let view = orch.view().await;
        assert_eq!(view.failed_pages, vec![5]);
        assert_eq!(view.listings.len(), 15);
        assert!(ids(&view.listings).contains(&format!("{}-2-0", region.as_str())));
        // Partial recovery does not touch the stored snapshot.
        assert_eq!(store.get(&region).await.unwrap().unwrap().listings.len(), 12);

        source.heal(5);
        let RetryOutcome::Completed(second) = orch.retry_failed().await.unwrap() else {
            panic!("retry cancelled");
        };
        assert_eq!(second.recovered, vec![5]);
        assert!(second.persisted);

        let view = orch.view().await;
        assert!(view.failed_pages.is_empty());
        assert!(view.error.is_none());
        let snapshot = store.get(&region).await.unwrap().unwrap();
        assert_eq!(snapshot.listings.len(), 18);
        assert_eq!(snapshot.total_pages, 6);
    }

    #[tokio::test]
    async fn retry_does_not_duplicate_known_listings() {
        let region = RegionKey::new("32");
        let source = Arc::new(ScriptedSource::new(3, &[3]));
        let orch = orchestrator(source.clone(), Arc::new(MemorySnapshotStore::new()), Arc::default());
        orch.load_region(region.clone(), FetchMode::Foreground, false)
            .await
            .unwrap();

        orch.mutate(&CancellationToken::new(), &region, |state| {
            state.listings.push(page_listings(&region, 3)[0].clone());
        })
        .await;
        source.heal(3);
        orch.retry_failed().await.unwrap();

        let view = orch.view().await;
        let unique = ids(&view.listings).into_iter().collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), view.listings.len());
        assert_eq!(view.listings.len(), 9);
    }

    #[tokio::test]
    async fn retry_without_region_or_failures() {
        let orch = orchestrator(
            Arc::new(ScriptedSource::new(1, &[])),
            Arc::new(MemorySnapshotStore::new()),
            Arc::default(),
        );
        assert!(matches!(
            orch.retry_failed().await,
            Err(SyncError::NoActiveRegion)
        ));

        orch.load_region(RegionKey::new("11"), FetchMode::Foreground, false)
            .await
            .unwrap();
        assert_eq!(
            orch.retry_failed().await.unwrap(),
            RetryOutcome::Completed(RetryReport::default())
        );
    }

    #[tokio::test]
    async fn first_page_failure_is_total_failure() {
        let region = RegionKey::new("31");
        let store = Arc::new(MemorySnapshotStore::new());
        let source = Arc::new(ScriptedSource::new(4, &[1]));
        let orch = orchestrator(source.clone(), store.clone(), Arc::default());

        let err = orch
            .load_region(region.clone(), FetchMode::Foreground, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::FirstPage { .. }));
        assert_eq!(source.calls().len(), 1);

        let view = orch.view().await;
        assert!(view.listings.is_empty());
        assert!(view.error.is_some());
        assert!(!view.progress.scanning);
        assert!(store.get(&region).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn manual_sync_ignores_snapshot_and_replaces_it() {
        let region = RegionKey::new("51");
        let store = Arc::new(MemorySnapshotStore::new());
        store.put(&region, &[listing("stale")], 1).await.unwrap();
        let source = Arc::new(ScriptedSource::new(2, &[]));
        let orch = orchestrator(source.clone(), store.clone(), Arc::default());

        assert!(matches!(
            orch.manual_sync(FetchMode::Foreground).await,
            Err(SyncError::NoActiveRegion)
        ));

        orch.load_region(region.clone(), FetchMode::Foreground, false)
            .await
            .unwrap();
        assert!(source.calls().is_empty());

        let report = completed(orch.manual_sync(FetchMode::Foreground).await.unwrap());
        assert_eq!(report.source, DatasetSource::Remote);
        assert_eq!(source.calls().len(), 2);

        let snapshot = store.get(&region).await.unwrap().unwrap();
        assert_eq!(ids(&snapshot.listings), expected_ids(&region, &[1, 2]));
    }

    #[tokio::test]
    async fn region_switch_cancels_in_flight_fetch() {
        let region_a = RegionKey::new("33");
        let region_b = RegionKey::new("34");
        let source = Arc::new(ScriptedSource::new(4, &[]));
        let (reached, release) = source.gate(&region_a, 3);
        let store = Arc::new(MemorySnapshotStore::new());
        let orch = orchestrator(source.clone(), store.clone(), Arc::default());

        let handle = orch.spawn_load(region_a.clone(), false).await;
        reached.notified().await;

        let in_flight = orch.view().await;
        assert!(in_flight.progress.scanning);
        assert!(in_flight.progress.background);
        assert_eq!(in_flight.progress.current_page, 2);
        assert_eq!(in_flight.progress.total_pages, 4);

        let report = completed(
            orch.load_region(region_b.clone(), FetchMode::Foreground, false)
                .await
                .unwrap(),
        );
        assert_eq!(report.region, region_b);
        release.notify_one();

        assert_eq!(handle.await.unwrap().unwrap(), FetchOutcome::Cancelled);
        assert!(store.get(&region_a).await.unwrap().is_none());

        let view = orch.view().await;
        assert_eq!(view.region, Some(region_b.clone()));
        assert_eq!(ids(&view.listings), expected_ids(&region_b, &[1, 2, 3, 4]));
        assert!(!view.progress.background);

        let pages_a = source
            .calls()
            .into_iter()
            .filter(|(r, _)| r == region_a.as_str())
            .map(|(_, p)| p)
            .collect::<Vec<_>>();
        assert_eq!(pages_a, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn region_switch_during_retry_persists_nothing() {
        let region_a = RegionKey::new("32");
        let region_b = RegionKey::new("35");
        let store = Arc::new(MemorySnapshotStore::new());
        let source = Arc::new(ScriptedSource::new(6, &[5]));
        let orch = orchestrator(source.clone(), store.clone(), Arc::default());
        orch.load_region(region_a.clone(), FetchMode::Foreground, false)
            .await
            .unwrap();
        assert_eq!(store.get(&region_a).await.unwrap().unwrap().listings.len(), 15);

        source.heal(5);
        let (reached, release) = source.gate(&region_a, 5);
        let retry = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.retry_failed().await })
        };
        reached.notified().await;

        let in_flight = orch.view().await;
        assert!(in_flight.progress.scanning);
        assert!(in_flight.failed_pages.is_empty());

        completed(
            orch.load_region(region_b.clone(), FetchMode::Foreground, false)
                .await
                .unwrap(),
        );
        release.notify_one();
        assert_eq!(retry.await.unwrap().unwrap(), RetryOutcome::Cancelled);

        let snapshot_a = store.get(&region_a).await.unwrap().unwrap();
        assert_eq!(ids(&snapshot_a.listings), expected_ids(&region_a, &[1, 2, 3, 4, 6]));
        assert_eq!(snapshot_a.total_pages, 6);

        let view = orch.view().await;
        assert_eq!(view.region, Some(region_b.clone()));
        assert_eq!(ids(&view.listings), expected_ids(&region_b, &[1, 2, 3, 4, 5, 6]));
        assert!(view.failed_pages.is_empty());
        assert!(!view.progress.scanning);
    }

    #[tokio::test]
    async fn manual_sync_during_retry_keeps_newer_snapshot() {
        let region = RegionKey::new("32");
        let store = Arc::new(MemorySnapshotStore::new());
        let source = Arc::new(ScriptedSource::new(6, &[5]));
        let orch = orchestrator(source.clone(), store.clone(), Arc::default());
        orch.load_region(region.clone(), FetchMode::Foreground, false)
            .await
            .unwrap();

        source.heal(5);
        let (reached, release) = source.gate(&region, 5);
        let retry = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.retry_failed().await })
        };
        reached.notified().await;

        let report = completed(orch.manual_sync(FetchMode::Foreground).await.unwrap());
        assert_eq!(report.listings, 18);
        release.notify_one();
        assert_eq!(retry.await.unwrap().unwrap(), RetryOutcome::Cancelled);

        let all = expected_ids(&region, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(ids(&orch.view().await.listings), all);
        assert_eq!(ids(&store.get(&region).await.unwrap().unwrap().listings), all);
    }

    #[tokio::test]
    async fn retry_is_refused_while_scanning() {
        let region = RegionKey::new("36");
        let source = Arc::new(ScriptedSource::new(3, &[]));
        let (reached, release) = source.gate(&region, 2);
        let orch = orchestrator(source, Arc::new(MemorySnapshotStore::new()), Arc::default());

        let handle = orch.spawn_load(region.clone(), false).await;
        reached.notified().await;
        assert!(matches!(
            orch.retry_failed().await,
            Err(SyncError::FetchInProgress)
        ));

        release.notify_one();
        let report = completed(handle.await.unwrap().unwrap());
        assert_eq!(report.listings, 9);
    }

    #[tokio::test]
    async fn snapshot_read_failure_falls_back_to_remote() {
        let store = Arc::new(BrokenStore {
            inner: MemorySnapshotStore::new(),
            fail_reads: true,
            fail_writes: false,
        });
        let source = Arc::new(ScriptedSource::new(2, &[]));
        let orch = orchestrator(source.clone(), store, Arc::default());
        let report = completed(
            orch.load_region(RegionKey::new("61"), FetchMode::Foreground, false)
                .await
                .unwrap(),
        );
        assert_eq!(report.source, DatasetSource::Remote);
        assert_eq!(report.listings, 6);
    }

    #[tokio::test]
    async fn snapshot_write_failure_keeps_fetched_data() {
        let store = Arc::new(BrokenStore {
            inner: MemorySnapshotStore::new(),
            fail_reads: false,
            fail_writes: true,
        });
        let source = Arc::new(ScriptedSource::new(3, &[]));
        let orch = orchestrator(source, store, Arc::default());
        let report = completed(
            orch.load_region(RegionKey::new("62"), FetchMode::Foreground, false)
                .await
                .unwrap(),
        );
        assert!(report.synced_at.is_some());
        let view = orch.view().await;
        assert_eq!(view.listings.len(), 9);
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic_across_pages() {
        let region = RegionKey::new("73");
        let source = Arc::new(ScriptedSource::new(5, &[3]));
        let pacer = Arc::new(ProgressRecorder::default());
        let orch = Arc::new(FetchOrchestrator::new(
            source,
            Arc::new(MemorySnapshotStore::new()),
            pacer.clone(),
            config(),
        ));
        *pacer.orchestrator.lock().unwrap() = Some(Arc::downgrade(&orch));

        orch.load_region(region, FetchMode::Foreground, true)
            .await
            .unwrap();
        let seen = pacer.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&5));
    }

    /// Pacer that records the progress counter at every pause.
    #[derive(Default)]
    struct ProgressRecorder {
        orchestrator: std::sync::Mutex<Option<std::sync::Weak<FetchOrchestrator>>>,
        seen: std::sync::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Pacer for ProgressRecorder {
        async fn pause(&self, _delay: Duration) {
            let orch = self
                .orchestrator
                .lock()
                .unwrap()
                .as_ref()
                .and_then(std::sync::Weak::upgrade);
            if let Some(orch) = orch {
                let current = orch.view().await.progress.current_page;
                self.seen.lock().unwrap().push(current);
            }
        }
    }

    #[tokio::test]
    async fn clear_cache_drops_snapshots() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.put(&RegionKey::new("11"), &[listing("x")], 1).await.unwrap();
        let orch = orchestrator(Arc::new(ScriptedSource::new(1, &[])), store.clone(), Arc::default());
        orch.clear_cache().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let value = serde_json::to_value(FetchOutcome::Cancelled).unwrap();
        assert_eq!(value["outcome"], "cancelled");
    }
}
