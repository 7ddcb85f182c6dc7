//! Axum JSON API over the region dataset, filters, saved jobs and platform stats.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use magang_adapters::PlatformStats;
use magang_core::{
    apply_filters, paginate, region_name, CriteriaChange, Facets, FilterCriteria, Listing,
    PageSlice, RegionKey, ViewSession, LISTINGS_PER_PAGE,
};
use magang_storage::{SavedJobsError, SavedJobsStore, SessionStore};
use magang_sync::{build_orchestrator, FetchOrchestrator, FetchProgress, SyncConfig, SyncError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "magang-web";

pub struct AppState {
    pub orchestrator: Arc<FetchOrchestrator>,
    pub session: Mutex<ViewSession>,
    pub session_store: SessionStore,
    pub saved: SavedJobsStore,
    pub stats: PlatformStats,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<FetchOrchestrator>,
        session: ViewSession,
        session_store: SessionStore,
        saved: SavedJobsStore,
        stats: PlatformStats,
    ) -> Self {
        Self {
            orchestrator,
            session: Mutex::new(session),
            session_store,
            saved,
            stats,
        }
    }

    async fn persist_session(&self, session: &ViewSession) {
        if let Err(err) = self.session_store.save(session).await {
            warn!(error = %err, "session save failed");
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ListingsQuery {
    program_study: Option<String>,
    position: Option<String>,
    region: Option<String>,
    city: Option<String>,
    company: Option<String>,
    education_level: Option<String>,
    page: Option<usize>,
}

impl ListingsQuery {
    fn merge_into(self, current: &FilterCriteria) -> FilterCriteria {
        FilterCriteria {
            program_study: self.program_study.unwrap_or_else(|| current.program_study.clone()),
            position: self.position.unwrap_or_else(|| current.position.clone()),
            region: self
                .region
                .map(RegionKey::new)
                .unwrap_or_else(|| current.region.clone()),
            city: self.city.unwrap_or_else(|| current.city.clone()),
            company: self.company.unwrap_or_else(|| current.company.clone()),
            education_level: self
                .education_level
                .unwrap_or_else(|| current.education_level.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListingsResponse {
    pub criteria: FilterCriteria,
    pub listings: PageSlice<Listing>,
    pub facets: Facets,
    pub status: DatasetStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStatus {
    pub region: Option<RegionKey>,
    pub region_name: Option<String>,
    pub listings: usize,
    pub progress: FetchProgress,
    pub failed_pages: Vec<u32>,
    pub error: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    pub total_pages: u32,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/listings", get(listings_handler))
        .route("/api/facets", get(facets_handler))
        .route("/api/status", get(status_handler))
        .route("/api/region/{code}", post(region_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/retry", post(retry_handler))
        .route("/api/saved", get(saved_list_handler))
        .route(
            "/api/saved/{id}",
            post(saved_add_handler).delete(saved_remove_handler),
        )
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Start loading the session's region in the background and serve the API.
pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(&config)?;
    let session_store = config.session_store();
    let mut session = session_store.load().await;
    if session.criteria.region.is_empty() {
        session.criteria.region = config.default_region.clone();
    }
    let stats = config.stats_client()?.fetch_or_default().await;

    let region = session.criteria.region.clone();
    // The background task is detached; its outcome is visible through /api/status.
    drop(orchestrator.spawn_load(region.clone(), false).await);

    let state = Arc::new(AppState::new(
        orchestrator,
        session,
        session_store,
        config.saved_jobs_store(),
        stats,
    ));
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, region = %region, "serving");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    let mut session = state.session.lock().await;
    let page = query.page;
    let next = query.merge_into(&session.criteria);
    let change = session.update_criteria(next);
    if change == CriteriaChange::RegionChanged && !session.criteria.region.is_empty() {
        drop(
            state
                .orchestrator
                .spawn_load(session.criteria.region.clone(), false)
                .await,
        );
    }
    if let Some(page) = page {
        session.set_page(page);
    }

    let (facets, listings) = state
        .orchestrator
        .with_view(|view| {
            let facets = session.reconcile(&view.listings);
            let filtered = apply_filters(&view.listings, &session.criteria);
            let slice = paginate(&filtered, session.page, LISTINGS_PER_PAGE);
            let listings = PageSlice {
                items: slice.items.into_iter().cloned().collect::<Vec<Listing>>(),
                page: slice.page,
                total_pages: slice.total_pages,
                total_items: slice.total_items,
            };
            (facets, listings)
        })
        .await;
    session.set_page(listings.page);

    state.persist_session(&session).await;
    let response = ListingsResponse {
        criteria: session.criteria.clone(),
        listings,
        facets,
        status: dataset_status(&state.orchestrator).await,
    };
    Json(response).into_response()
}

async fn facets_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut session = state.session.lock().await;
    let before = session.clone();
    let facets = state
        .orchestrator
        .with_view(|view| session.reconcile(&view.listings))
        .await;
    if *session != before {
        state.persist_session(&session).await;
    }
    Json(facets).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(dataset_status(&state.orchestrator).await).into_response()
}

async fn region_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(code): AxumPath<String>,
) -> Response {
    if region_name(&code).is_none() {
        return api_error(StatusCode::BAD_REQUEST, format!("unknown region code {code:?}"));
    }
    let region = RegionKey::new(code);

    let mut session = state.session.lock().await;
    let next = FilterCriteria {
        region: region.clone(),
        ..session.criteria.clone()
    };
    session.update_criteria(next);
    drop(state.orchestrator.spawn_load(region, false).await);
    state.persist_session(&session).await;
    drop(session);

    (
        StatusCode::ACCEPTED,
        Json(dataset_status(&state.orchestrator).await),
    )
        .into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(region) = state.orchestrator.active_region().await else {
        return sync_error(SyncError::NoActiveRegion);
    };
    drop(state.orchestrator.spawn_load(region, true).await);
    (
        StatusCode::ACCEPTED,
        Json(dataset_status(&state.orchestrator).await),
    )
        .into_response()
}

async fn retry_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.retry_failed().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn saved_list_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.saved.list().await {
        Ok(saved) => Json(saved).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn saved_add_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let listing = state
        .orchestrator
        .with_view(|view| view.listings.iter().find(|l| l.id == id).cloned())
        .await;
    let Some(listing) = listing else {
        return api_error(StatusCode::NOT_FOUND, format!("listing {id} is not loaded"));
    };
    match state.saved.save(&listing).await {
        Ok(saved) => Json(serde_json::json!({ "saved": saved })).into_response(),
        Err(err @ SavedJobsError::Full) => api_error(StatusCode::CONFLICT, err.to_string()),
        Err(SavedJobsError::Storage(err)) => server_error(err.into()),
    }
}

async fn saved_remove_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.saved.remove(&id).await {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.stats).into_response()
}

async fn dataset_status(orchestrator: &FetchOrchestrator) -> DatasetStatus {
    orchestrator
        .with_view(|view| DatasetStatus {
            region: view.region.clone(),
            region_name: view
                .region
                .as_ref()
                .and_then(|r| r.display_name())
                .map(str::to_string),
            listings: view.listings.len(),
            progress: view.progress,
            failed_pages: view.failed_pages.clone(),
            error: view.error.clone(),
            last_synced: view.last_synced,
            total_pages: view.total_pages,
        })
        .await
}

fn api_error(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match err {
        SyncError::NoActiveRegion | SyncError::FetchInProgress => StatusCode::CONFLICT,
        SyncError::FirstPage { .. } => StatusCode::BAD_GATEWAY,
        SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}
