//! Peer-facing routes.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::instrument;

use super::{ApiError, origin};
use crate::health::HealthReport;
use crate::registry::RemoteRegistration;
use crate::service::FederationService;
use crate::storage::Instance;
use crate::transport::{Ack, CHANGES_PATH, Envelope, INBOX_PATH, REGISTER_PATH};

pub fn routes() -> Router<FederationService> {
    Router::new()
        .route(INBOX_PATH, post(inbox))
        .route(CHANGES_PATH, post(changes))
        .route(REGISTER_PATH, post(register))
        .route("/health", get(health))
}

/// `POST /federation/v1/inbox`
#[instrument(skip_all)]
async fn inbox(
    State(svc): State<FederationService>,
    headers: HeaderMap,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(envelope) = payload?;
    let ack = svc
        .queue
        .receive(&envelope, origin(&headers).as_deref())
        .await?;
    Ok(Json(ack))
}

/// `POST /federation/v1/changes`
#[instrument(skip_all)]
async fn changes(
    State(svc): State<FederationService>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> Result<Json<Envelope>, ApiError> {
    let Json(request) = payload?;
    Ok(Json(svc.feed.serve(&request).await?))
}

/// `POST /federation/v1/register`
#[instrument(skip_all)]
async fn register(
    State(svc): State<FederationService>,
    headers: HeaderMap,
    payload: Result<Json<RemoteRegistration>, JsonRejection>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    let Json(registration) = payload?;
    let instance = svc
        .registry
        .register_remote(
            &registration,
            origin(&headers).as_deref(),
            svc.config.inbound.max_clock_skew_secs,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// `GET /health`
async fn health(State(svc): State<FederationService>) -> Result<Json<HealthReport>, ApiError> {
    Ok(Json(HealthReport::collect(&svc.db).await?))
}
