//! Operator endpoints. Callers are authenticated upstream.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use gigfeed_jobs::{seed_sample_data, JobKind, SampleDataGenerator, TriggerOutcome, TriggerSource};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{bad_request, json_error, server_error, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct TrainRequest {
    task_type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SeedQuery {
    seed: Option<u64>,
    users: Option<usize>,
    listings: Option<usize>,
    interactions_per_user: Option<usize>,
}

pub(crate) async fn train_handler(State(state): State<Arc<AppState>>, Json(body): Json<TrainRequest>) -> Response {
    let kind: JobKind = match body.task_type.parse() {
        Ok(kind) => kind,
        Err(err) => return bad_request(err),
    };
    let outcome = state.orchestrator.trigger(kind, TriggerSource::Manual).await;
    let status = match &outcome {
        TriggerOutcome::Success(_) => StatusCode::OK,
        TriggerOutcome::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        TriggerOutcome::AlreadyRunning { .. } => StatusCode::CONFLICT,
    };
    (status, Json(outcome)).into_response()
}

pub(crate) async fn generate_sample_data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SeedQuery>,
) -> Response {
    let Some(catalog) = state.seed_catalog.as_ref() else {
        return json_error(
            StatusCode::CONFLICT,
            "sample data needs the in-process catalog; unset GIGFEED_CATALOG_URL",
        );
    };
    let mut generator = SampleDataGenerator::new(query.seed);
    if let Some(users) = query.users {
        generator.num_users = users;
    }
    if let Some(listings) = query.listings {
        generator.num_listings = listings;
    }
    if let Some(per_user) = query.interactions_per_user {
        generator.interactions_per_user = per_user;
    }
    match seed_sample_data(&mut generator, catalog, state.log.as_ref(), Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

pub(crate) async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.status()).into_response()
}

pub(crate) async fn cancel_handler(State(state): State<Arc<AppState>>, AxumPath(kind): AxumPath<String>) -> Response {
    let kind: JobKind = match kind.parse() {
        Ok(kind) => kind,
        Err(err) => return bad_request(err),
    };
    if state.orchestrator.cancel(kind) {
        info!(job = %kind, "cancellation requested over http");
        (StatusCode::ACCEPTED, Json(json!({ "task_type": kind, "cancelled": true }))).into_response()
    } else {
        json_error(StatusCode::CONFLICT, format!("{kind} job is not running"))
    }
}
