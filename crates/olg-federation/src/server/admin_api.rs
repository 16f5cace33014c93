//! Operator routes. Every handler takes a [`Caller`]; components enforce
//! capabilities.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::instrument;

use super::{ApiError, Caller, origin};
use crate::audit::ChainReport;
use crate::auth::{Actor, AuthError, Capability};
use crate::queue::EnqueueRequest;
use crate::registry::RegisterRequest;
use crate::service::FederationService;
use crate::storage::queries_audit::AuditFilter;
use crate::storage::queries_messages::MessageFilter;
use crate::storage::{
    AuditEntry, Direction, FederationMessage, Instance, LocalChange, MessageStatus, SyncCursor,
    TrustLevel,
};
use crate::sync::SyncOutcome;

type JsonBody<T> = Result<Json<T>, JsonRejection>;
type QueryParams<T> = Result<Query<T>, QueryRejection>;

pub fn routes() -> Router<FederationService> {
    Router::new()
        .route("/instances", get(list_instances).post(register_instance))
        .route("/instances/{id}", get(get_instance))
        .route("/instances/{id}/trust", post(set_trust_level))
        .route("/instances/{id}/deactivate", post(deactivate))
        .route("/instances/{id}/flag", post(flag).delete(clear_flag))
        .route("/instances/{id}/messages", post(enqueue))
        .route("/messages", get(list_messages))
        .route("/messages/{seq}", get(get_message))
        .route("/messages/{seq}/requeue", post(requeue))
        .route("/sync/{id}/{resource_type}/reconcile", post(reconcile))
        .route("/sync/{id}/{resource_type}/resume", post(resume))
        .route("/changes", post(publish))
        .route("/audit", get(query_audit))
        .route("/audit/verify", get(verify_audit))
        .route("/audit/{id}/corrections", post(correct_audit))
}

/// Read access: auditors or administrators.
fn require_reader(actor: &Actor) -> Result<(), AuthError> {
    if actor.has(Capability::AuditRead) {
        return Ok(());
    }
    actor.require(Capability::FederationAdmin)
}

// =========================================================================
// Instances
// =========================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ListInstancesQuery {
    include_inactive: bool,
}

async fn list_instances(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    query: QueryParams<ListInstancesQuery>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    require_reader(&actor)?;
    let Query(query) = query?;
    Ok(Json(svc.registry.list(query.include_inactive).await?))
}

#[instrument(skip_all, fields(actor = %actor))]
async fn register_instance(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    headers: HeaderMap,
    body: JsonBody<RegisterRequest>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    let Json(request) = body?;
    let instance = svc
        .registry
        .register(&request, &actor, origin(&headers).as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn get_instance(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    require_reader(&actor)?;
    Ok(Json(svc.registry.get(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustChange {
    trust_level: TrustLevel,
}

#[instrument(skip_all, fields(actor = %actor, instance_id = %id))]
async fn set_trust_level(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: JsonBody<TrustChange>,
) -> Result<Json<Instance>, ApiError> {
    let Json(change) = body?;
    let instance = svc
        .registry
        .set_trust_level(&id, change.trust_level, &actor, origin(&headers).as_deref())
        .await?;
    Ok(Json(instance))
}

#[instrument(skip_all, fields(actor = %actor, instance_id = %id))]
async fn deactivate(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Instance>, ApiError> {
    let instance = svc
        .registry
        .deactivate(&id, &actor, origin(&headers).as_deref())
        .await?;
    Ok(Json(instance))
}

#[derive(Debug, Deserialize)]
struct FlagRequest {
    reason: String,
}

async fn flag(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: JsonBody<FlagRequest>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Capability::FederationAdmin)?;
    let Json(request) = body?;
    let flagged = svc
        .registry
        .flag_for_review(&id, &actor, &request.reason, origin(&headers).as_deref())
        .await?;
    Ok(Json(json!({ "flagged": flagged })))
}

async fn clear_flag(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Instance>, ApiError> {
    let instance = svc
        .registry
        .clear_review_flag(&id, &actor, origin(&headers).as_deref())
        .await?;
    Ok(Json(instance))
}

// =========================================================================
// Messages
// =========================================================================

async fn enqueue(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(id): Path<String>,
    body: JsonBody<EnqueueRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    actor.require(Capability::FederationAdmin)?;
    let Json(request) = body?;
    let message_id = svc
        .queue
        .enqueue(&id, request.message_type, request.payload, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "messageId": message_id }))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MessageQuery {
    instance_id: Option<String>,
    direction: Option<Direction>,
    status: Option<MessageStatus>,
    limit: Option<i64>,
}

async fn list_messages(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    query: QueryParams<MessageQuery>,
) -> Result<Json<Vec<FederationMessage>>, ApiError> {
    require_reader(&actor)?;
    let Query(query) = query?;
    let filter = MessageFilter {
        instance_id: query.instance_id,
        direction: query.direction,
        status: query.status,
        limit: query.limit,
    };
    Ok(Json(svc.queue.list(&filter).await?))
}

async fn get_message(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(seq): Path<i64>,
) -> Result<Json<FederationMessage>, ApiError> {
    require_reader(&actor)?;
    Ok(Json(svc.queue.get(seq).await?))
}

#[instrument(skip_all, fields(actor = %actor, seq = seq))]
async fn requeue(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(seq): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<FederationMessage>, ApiError> {
    let message = svc
        .queue
        .requeue(seq, &actor, origin(&headers).as_deref())
        .await?;
    Ok(Json(message))
}

// =========================================================================
// Sync
// =========================================================================

#[instrument(skip_all, fields(actor = %actor, instance_id = %id, resource_type = %resource_type))]
async fn reconcile(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path((id, resource_type)): Path<(String, String)>,
) -> Result<Json<SyncOutcome>, ApiError> {
    actor.require(Capability::FederationAdmin)?;
    Ok(Json(svc.sync.reconcile(&id, &resource_type).await?))
}

#[instrument(skip_all, fields(actor = %actor, instance_id = %id, resource_type = %resource_type))]
async fn resume(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path((id, resource_type)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<SyncCursor>, ApiError> {
    let cursor = svc
        .sync
        .resume(&id, &resource_type, &actor, origin(&headers).as_deref())
        .await?;
    Ok(Json(cursor))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    resource_type: String,
    resource_id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

async fn publish(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    headers: HeaderMap,
    body: JsonBody<PublishRequest>,
) -> Result<(StatusCode, Json<LocalChange>), ApiError> {
    let Json(request) = body?;
    let change = svc
        .feed
        .publish(
            &request.resource_type,
            &request.resource_id,
            request.fields,
            &actor,
            origin(&headers).as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(change)))
}

// =========================================================================
// Audit
// =========================================================================

async fn query_audit(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    headers: HeaderMap,
    query: QueryParams<AuditFilter>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let Query(filter) = query?;
    let entries = svc
        .audit
        .query(&actor, &filter, origin(&headers).as_deref())
        .await?;
    Ok(Json(entries))
}

async fn verify_audit(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
) -> Result<Json<ChainReport>, ApiError> {
    require_reader(&actor)?;
    Ok(Json(svc.audit.verify_chain().await?))
}

#[derive(Debug, Deserialize)]
struct CorrectionRequest {
    reason: String,
    #[serde(default)]
    corrected: Option<Value>,
}

async fn correct_audit(
    Caller(actor): Caller,
    State(svc): State<FederationService>,
    Path(id): Path<String>,
    body: JsonBody<CorrectionRequest>,
) -> Result<(StatusCode, Json<AuditEntry>), ApiError> {
    let Json(request) = body?;
    let entry = svc
        .audit
        .correct(&actor, &id, &request.reason, request.corrected)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
