//! Axum JSON surface for the feed engine.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use gigfeed_core::{
    parse_listing_id, parse_user_uid, FeedError, FeedPreferencesUpdate, FeedRequest, InteractionEvent, InteractionType,
};
use gigfeed_jobs::{start_scheduler, Engine, EngineConfig, Orchestrator};
use gigfeed_ranker::{FeedService, HistoryQuery, NearbyQuery, RankError};
use gigfeed_storage::{InteractionLog, MemoryCatalog};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

mod admin;

pub const CRATE_NAME: &str = "gigfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub feed: FeedService,
    pub orchestrator: Arc<Orchestrator>,
    pub log: Arc<dyn InteractionLog>,
    /// Present only for an in-process catalog; seeding is refused otherwise.
    pub seed_catalog: Option<Arc<MemoryCatalog>>,
}

impl AppState {
    pub fn from_engine(engine: &Engine) -> Self {
        Self {
            feed: FeedService::new(
                Arc::clone(&engine.catalog),
                Arc::clone(&engine.log),
                Arc::clone(&engine.snapshots),
                engine.policy,
            )
            .with_preferences(Arc::clone(&engine.preferences)),
            orchestrator: Arc::clone(&engine.orchestrator),
            log: Arc::clone(&engine.log),
            seed_catalog: engine.memory_catalog.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    user_uid: String,
    limit: Option<usize>,
    offset: Option<usize>,
    exclude_seen: Option<bool>,
    exclude_applied: Option<bool>,
}

/// `?user_uid=` alone.
#[derive(Debug, Deserialize)]
struct InteractionQuery {
    user_uid: String,
}

#[derive(Debug, Deserialize)]
struct InteractionBody {
    interaction_type: String,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    user_uid: String,
    /// Comma-separated interaction types.
    types: Option<String>,
    limit: Option<usize>,
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TrendingQuery {
    limit: Option<usize>,
    hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PreferencesQuery {
    user_uid: String,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/feed", get(feed_handler))
        .route("/feed/interactions", get(history_handler))
        .route("/feed/interactions/{listing_id}", post(record_interaction_handler))
        .route("/feed/trending", get(trending_handler))
        .route("/feed/similar/{listing_id}", get(similar_handler))
        .route("/feed/metrics/{listing_id}", get(metrics_handler))
        .route("/feed/nearby", post(nearby_handler))
        .route(
            "/feed/preferences",
            get(feed_preferences_handler).patch(update_feed_preferences_handler),
        )
        .route("/feed/preferences/tags", get(preferences_handler))
        .route("/admin/train-ml", post(admin::train_handler))
        .route("/admin/generate-sample-data", post(admin::generate_sample_data_handler))
        .route("/admin/jobs", get(admin::jobs_handler))
        .route("/admin/jobs/{kind}/cancel", post(admin::cancel_handler))
        .with_state(Arc::new(state))
}

/// Starts the scheduler (when enabled) and serves until the listener closes.
pub async fn serve(engine: Engine) -> anyhow::Result<()> {
    let _scheduler = start_scheduler(&engine.config, Arc::clone(&engine.orchestrator)).await?;
    let listener = TcpListener::bind(engine.config.bind_addr.as_str())
        .await
        .with_context(|| format!("binding {}", engine.config.bind_addr))?;
    info!(
        addr = %engine.config.bind_addr,
        event_store = engine.log.backend(),
        "feed engine listening"
    );
    axum::serve(listener, app(AppState::from_engine(&engine))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let engine = Engine::from_config(EngineConfig::from_env()).await?;
    serve(engine).await
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn feed_handler(State(state): State<Arc<AppState>>, Query(query): Query<FeedQuery>) -> Response {
    let user_uid = match parse_user_uid(&query.user_uid) {
        Ok(uid) => uid,
        Err(err) => return bad_request(err),
    };
    let defaults = FeedRequest::new(user_uid, state.feed.policy().feed.default_limit);
    let request = FeedRequest {
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
        exclude_seen: query.exclude_seen.unwrap_or(defaults.exclude_seen),
        exclude_applied: query.exclude_applied.unwrap_or(defaults.exclude_applied),
        ..defaults
    };
    match state.feed.feed(&request, Utc::now()).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => rank_error(err),
    }
}

async fn record_interaction_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(listing_id): AxumPath<String>,
    Query(query): Query<InteractionQuery>,
    Json(body): Json<InteractionBody>,
) -> Response {
    let parsed = parse_listing_id(&listing_id).and_then(|listing_id| {
        let user_uid = parse_user_uid(&query.user_uid)?;
        let kind: InteractionType = body.interaction_type.parse()?;
        Ok((user_uid, listing_id, kind))
    });
    let (user_uid, listing_id, kind) = match parsed {
        Ok(parts) => parts,
        Err(err) => return bad_request(err),
    };

    let mut event = InteractionEvent::new(user_uid, listing_id, kind, Utc::now());
    event.metadata = body.metadata.unwrap_or_default();
    match state.feed.record(event.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(event)).into_response(),
        Err(err) => rank_error(err),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>, Query(params): Query<HistoryParams>) -> Response {
    let user_uid = match parse_user_uid(&params.user_uid) {
        Ok(uid) => uid,
        Err(err) => return bad_request(err),
    };
    let types = match parse_types(params.types.as_deref()) {
        Ok(types) => types,
        Err(err) => return bad_request(err),
    };
    let defaults = HistoryQuery::new(user_uid);
    let query = HistoryQuery {
        types,
        limit: params.limit.unwrap_or(defaults.limit),
        days: params.days.unwrap_or(defaults.days),
        ..defaults
    };
    match state.feed.history(&query, Utc::now()).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => rank_error(err),
    }
}

fn parse_types(raw: Option<&str>) -> Result<Option<Vec<InteractionType>>, FeedError> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

async fn trending_handler(State(state): State<Arc<AppState>>, Query(query): Query<TrendingQuery>) -> Response {
    let policy = state.feed.policy();
    let limit = query.limit.unwrap_or(policy.trending.size);
    let hours = query.hours.unwrap_or(policy.trending.window_hours);
    match state.feed.trending(limit, hours, Utc::now()).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => rank_error(err),
    }
}

async fn similar_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(listing_id): AxumPath<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let listing_id = match parse_listing_id(&listing_id) {
        Ok(id) => id,
        Err(err) => return bad_request(err),
    };
    match state.feed.similar(listing_id, query.limit.unwrap_or(10)).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => rank_error(err),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>, AxumPath(listing_id): AxumPath<String>) -> Response {
    let listing_id = match parse_listing_id(&listing_id) {
        Ok(id) => id,
        Err(err) => return bad_request(err),
    };
    match state.feed.metrics(listing_id) {
        Some(metrics) => Json(metrics).into_response(),
        None => json_error(StatusCode::NOT_FOUND, format!("no engagement metrics for listing {listing_id}")),
    }
}

async fn nearby_handler(State(state): State<Arc<AppState>>, Json(query): Json<NearbyQuery>) -> Response {
    match state.feed.nearby(&query).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => rank_error(err),
    }
}

async fn feed_preferences_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InteractionQuery>,
) -> Response {
    let user_uid = match parse_user_uid(&query.user_uid) {
        Ok(uid) => uid,
        Err(err) => return bad_request(err),
    };
    match state.feed.feed_preferences(user_uid).await {
        Ok(prefs) => Json(prefs).into_response(),
        Err(err) => rank_error(err),
    }
}

async fn update_feed_preferences_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InteractionQuery>,
    Json(update): Json<FeedPreferencesUpdate>,
) -> Response {
    let user_uid = match parse_user_uid(&query.user_uid) {
        Ok(uid) => uid,
        Err(err) => return bad_request(err),
    };
    match state.feed.update_feed_preferences(user_uid, update, Utc::now()).await {
        Ok(prefs) => Json(prefs).into_response(),
        Err(err) => rank_error(err),
    }
}

async fn preferences_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PreferencesQuery>,
) -> Response {
    let user_uid = match parse_user_uid(&query.user_uid) {
        Ok(uid) => uid,
        Err(err) => return bad_request(err),
    };
    let limit = query.limit.unwrap_or(gigfeed_ranker::preferences::DEFAULT_PREFERENCE_LIMIT);
    match state.feed.tag_preferences(user_uid, limit).await {
        Ok(prefs) => Json(prefs).into_response(),
        Err(err) => rank_error(err),
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn bad_request(err: impl std::fmt::Display) -> Response {
    json_error(StatusCode::BAD_REQUEST, err.to_string())
}

fn server_error(status: StatusCode, err: anyhow::Error) -> Response {
    error!(status = status.as_u16(), error = %format!("{err:#}"), "request failed");
    json_error(status, format!("{err:#}"))
}

fn rank_error(err: RankError) -> Response {
    match err {
        RankError::Invalid(err) => bad_request(err),
        RankError::Upstream(err) => server_error(StatusCode::SERVICE_UNAVAILABLE, err),
        RankError::EventStore(err) | RankError::PreferenceStore(err) => {
            server_error(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}
