//! HTTP surface.
//!
//! Viewport lookups accumulate per session, so they live under
//! `/sessions/{session}`. Search and arrivals answer each request from its
//! own provider round trip and need no session. Clients debounce their own
//! input before calling; [`crate::session::MapSession`] is the in-process
//! equivalent that debounces for an embedding application.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

use crate::arrivals::fetch_arrivals;
use crate::config::TransitConfig;
use crate::error::{AppError, AppResult, Pipeline, PipelineError, TransitError};
use crate::models::{Arrival, IncomingTrip, Region, Stop, ViewState};
use crate::provider::TransitProvider;
use crate::realtime::TripUpdatesClient;
use crate::search::{find_stops, searchable};
use crate::stops::{Refresh, StopCollection, StopLookup};

pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Stop collection belonging to one client map screen.
pub struct Session {
    pub stops: StopLookup,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn new(provider: Arc<dyn TransitProvider>, config: &TransitConfig) -> Self {
        Self {
            stops: StopLookup::new(provider, config),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_seen
            .lock()
            .map(|last_seen| now.saturating_duration_since(*last_seen))
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<TransitConfig>,
    provider: Arc<dyn TransitProvider>,
    trip_updates: Arc<TripUpdatesClient>,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl AppState {
    pub fn new(
        config: TransitConfig,
        provider: Arc<dyn TransitProvider>,
        trip_updates: TripUpdatesClient,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            trip_updates: Arc::new(trip_updates),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn session(&self, id: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(id) {
            session.touch();
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                info!("Opening session {}", id);
                Arc::new(Session::new(self.provider.clone(), &self.config))
            })
            .clone();
        session.touch();
        session
    }

    /// Drops sessions nobody has touched for the configured idle time.
    /// Returns how many were dropped.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.session_idle;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.idle_for(now) < max_idle;
            if !keep {
                info!("Closing idle session {}", id);
            }
            keep
        });
        before - sessions.len()
    }

    /// Runs [`AppState::evict_idle`] every `every` until the handle is aborted.
    pub fn spawn_session_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = state.evict_idle().await;
                if evicted > 0 {
                    info!("Evicted {} idle sessions", evicted);
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
}

pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/search", get(search_stops))
        .route("/stops/{stop_id}/arrivals", get(get_arrivals))
        .route("/stops/{stop_id}/trip-updates", get(get_trip_updates))
        .route("/sessions/{session}", delete(close_session))
        .route("/sessions/{session}/stops", get(get_stops_in_region))
        .route("/sessions/{session}/stops/all", get(get_all_stops))
        .layer(cors)
        .with_state(app_state)
}

async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn close_session(
    State(app_state): State<AppState>,
    Path(session): Path<String>,
) -> StatusCode {
    match app_state.sessions.write().await.remove(&session) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

// Pipeline failures are part of the returned view; only bad input is an HTTP error.
async fn get_stops_in_region(
    State(app_state): State<AppState>,
    Path(session): Path<String>,
    Query(region): Query<Region>,
) -> AppResult<Json<ViewState<StopCollection>>> {
    let session = app_state.session(&session).await;
    if let Err(e) = session.stops.refresh(region).await {
        if let TransitError::InvalidRegion(_) = e.source {
            return Err(AppError::Pipeline(e));
        }
    }
    Ok(Json(session.stops.view()))
}

async fn get_all_stops(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ViewState<StopCollection>> {
    let session = app_state.session(&id).await;
    // Failures are recorded in the returned view.
    if let Ok(Refresh::Superseded) = session.stops.load_all().await {
        debug!("Whole-network load for session {} was superseded", id);
    }
    Json(session.stops.view())
}

fn into_view<T: Default>(pipeline: Pipeline, result: Result<T, TransitError>) -> ViewState<T> {
    match result {
        Ok(data) => ViewState {
            data,
            loading: false,
            error: None,
        },
        Err(source) => {
            let err = PipelineError::new(pipeline, source);
            error!("Request failed: {}", err);
            ViewState {
                data: T::default(),
                loading: false,
                error: Some(err.user_message().to_string()),
            }
        }
    }
}

async fn search_stops(
    State(app_state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<ViewState<Vec<Stop>>> {
    let config = &app_state.config;
    let Some(query) = searchable(&query.q, config.min_query_len) else {
        return Json(ViewState::default());
    };

    let result = find_stops(
        app_state.provider.as_ref(),
        query,
        &config.operators,
        config.search_limit,
    )
    .await;
    Json(into_view(Pipeline::Search, result))
}

async fn get_arrivals(
    State(app_state): State<AppState>,
    Path(stop_id): Path<String>,
) -> AppResult<Json<ViewState<Vec<Arrival>>>> {
    if stop_id.trim().is_empty() {
        return Err(AppError::BadRequest("stop id must not be empty".to_string()));
    }

    let config = &app_state.config;
    let now = Utc::now().with_timezone(&config.timezone);
    let result = fetch_arrivals(
        app_state.provider.as_ref(),
        &stop_id,
        config.departures_limit,
        config.arrival_horizon_minutes,
        &now,
    )
    .await;
    Ok(Json(into_view(Pipeline::Arrivals, result)))
}

async fn get_trip_updates(
    State(app_state): State<AppState>,
    Path(stop_id): Path<String>,
) -> AppResult<Json<Vec<IncomingTrip>>> {
    let incoming = app_state.trip_updates.incoming_at_stop(&stop_id).await?;
    Ok(Json(incoming))
}
