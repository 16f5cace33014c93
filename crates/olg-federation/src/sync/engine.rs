//! Reconciliation sessions and batch application.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use sqlx::SqliteConnection;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use olg_core::Config;
use olg_core::db::unix_timestamp;
use olg_crypto::SigningIdentity;

use super::SyncError;
use super::conflict::{FieldVersion, resolve};
use super::policy::accept;
use super::types::{Change, ChangeBatch, PROTOCOL_VERSION, SyncAvailable, SyncRequest};
use crate::audit::{AuditAction, AuditLog, NewAuditEntry, resource};
use crate::auth::{Actor, Capability};
use crate::locks::{KeyedLocks, instance_key, sync_key};
use crate::queue::{HandlerError, InboundHandler};
use crate::registry::flag_in;
use crate::storage::queries_instances as instances;
use crate::storage::queries_sync as sync;
use crate::storage::{
    CursorStatus, DatabaseError, FederationDatabase, Instance, MessageType, RemoteRecord,
    SessionStatus, SyncCursor, SyncSession,
};
use crate::transport::{Envelope, Transport, TransportError};

/// Where a (peer, resource type) pair is in its reconcile cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Fetching,
    Applying,
    Failed,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub cursor_before: i64,
    pub cursor_after: i64,
    pub changes_applied: i64,
    pub fields_rejected: i64,
}

/// Result of a completed reconcile run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub session_id: String,
    pub cursor_before: i64,
    pub cursor_after: i64,
    pub batches: u32,
    pub changes_applied: i64,
    pub fields_rejected: i64,
}

/// Totals from [`SyncEngine::reconcile_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub completed: u32,
    pub failed: u32,
    pub halted: u32,
}

fn cursor_key(instance_id: &str, resource_type: &str) -> String {
    format!("{instance_id}:{resource_type}")
}

fn cursor_snapshot(cursor: Option<&SyncCursor>) -> Value {
    cursor.map_or_else(
        || json!({ "position": 0, "status": CursorStatus::Active }),
        |c| json!({ "position": c.position, "status": c.status, "last_error": c.last_error }),
    )
}

/// Reconciles replicated state with peers.
#[derive(Clone)]
pub struct SyncEngine {
    db: FederationDatabase,
    locks: KeyedLocks,
    transport: Arc<dyn Transport>,
    identity: Arc<SigningIdentity>,
    local_domain: String,
    batch_limit: u32,
    fetch_timeout: Duration,
    max_clock_skew_secs: i64,
    interval: Duration,
    resource_types: Arc<Vec<String>>,
    states: Arc<Mutex<HashMap<(String, String), SessionState>>>,
}

impl SyncEngine {
    pub fn new(
        db: FederationDatabase,
        locks: KeyedLocks,
        transport: Arc<dyn Transport>,
        identity: Arc<SigningIdentity>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            locks,
            transport,
            identity,
            local_domain: config.instance.domain.clone(),
            batch_limit: config.sync.batch_limit.max(1),
            fetch_timeout: Duration::from_secs(config.sync.fetch_timeout_secs),
            max_clock_skew_secs: config.inbound.max_clock_skew_secs,
            interval: Duration::from_secs(config.sync.interval_secs.max(1)),
            resource_types: Arc::new(config.sync.resource_types.clone()),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    /// Current state of the pair. Pairs never reconciled are `Idle`.
    pub async fn session_state(&self, instance_id: &str, resource_type: &str) -> SessionState {
        self.states
            .lock()
            .await
            .get(&(instance_id.to_string(), resource_type.to_string()))
            .copied()
            .unwrap_or_default()
    }

    async fn set_state(&self, instance_id: &str, resource_type: &str, state: SessionState) {
        self.states
            .lock()
            .await
            .insert((instance_id.to_string(), resource_type.to_string()), state);
    }

    /// Fetch and apply everything the peer has after our cursor.
    ///
    /// Runs for the same pair are serialized; different pairs run in parallel.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        instance_id: &str,
        resource_type: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let _session = self.locks.lock(&sync_key(instance_id, resource_type)).await;
        self.reconcile_held(instance_id, resource_type).await
    }

    /// Body of [`reconcile`](Self::reconcile). The caller holds the pair's sync lock.
    async fn reconcile_held(
        &self,
        instance_id: &str,
        resource_type: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let (peer, cursor) = {
            let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
            let peer = instances::get(&mut conn, instance_id)
                .await
                .map_err(|e| instance_not_found(e, instance_id))?;
            let cursor = sync::get_cursor(&mut conn, instance_id, resource_type).await?;
            (peer, cursor)
        };
        if !peer.active {
            return Err(SyncError::InstanceInactive(peer.id));
        }
        if peer.flagged_for_review {
            debug!(instance_id = %instance_id, resource_type, "Peer under review, skipping reconcile");
            return Err(SyncError::UnderReview(peer.id));
        }
        if cursor.as_ref().is_some_and(|c| c.status == CursorStatus::DeadLettered) {
            return Err(SyncError::Halted {
                instance_id: instance_id.to_string(),
                resource_type: resource_type.to_string(),
            });
        }

        let position = cursor.map_or(0, |c| c.position);
        let started_at = unix_timestamp();
        let mut outcome = SyncOutcome {
            session_id: uuid::Uuid::new_v4().to_string(),
            cursor_before: position,
            cursor_after: position,
            batches: 0,
            changes_applied: 0,
            fields_rejected: 0,
        };

        loop {
            self.set_state(instance_id, resource_type, SessionState::Fetching)
                .await;
            let batch = match self.fetch(&peer, resource_type, outcome.cursor_after).await {
                Ok(batch) => batch,
                Err(e) => return Err(self.fail(&peer, resource_type, &outcome, started_at, e).await),
            };
            if batch.changes.is_empty() {
                break;
            }

            self.set_state(instance_id, resource_type, SessionState::Applying)
                .await;
            let report = match self.apply(instance_id, resource_type, &batch).await {
                Ok(report) => report,
                Err(e) => return Err(self.fail(&peer, resource_type, &outcome, started_at, e).await),
            };

            let progressed = report.cursor_after > outcome.cursor_after;
            outcome.batches += 1;
            outcome.cursor_after = report.cursor_after;
            outcome.changes_applied += report.changes_applied;
            outcome.fields_rejected += report.fields_rejected;
            if !batch.has_more || !progressed {
                break;
            }
        }

        self.set_state(instance_id, resource_type, SessionState::Idle)
            .await;
        self.record_session(&peer, resource_type, &outcome, started_at, SessionStatus::Completed, None)
            .await?;

        info!(
            instance_id = %instance_id,
            domain = %peer.domain,
            resource_type,
            cursor_before = outcome.cursor_before,
            cursor_after = outcome.cursor_after,
            changes_applied = outcome.changes_applied,
            fields_rejected = outcome.fields_rejected,
            "Reconciliation completed"
        );
        Ok(outcome)
    }

    /// Request one batch after `after` and check it came from the peer intact.
    async fn fetch(
        &self,
        peer: &Instance,
        resource_type: &str,
        after: i64,
    ) -> Result<ChangeBatch, SyncError> {
        let request = Envelope::new(
            uuid::Uuid::new_v4().to_string(),
            self.local_domain.clone(),
            peer.domain.clone(),
            MessageType::SyncRequest,
            serde_json::to_value(SyncRequest {
                resource_type: resource_type.to_string(),
                after,
                limit: self.batch_limit,
            })?,
        )
        .signed(&self.identity);

        let response = tokio::time::timeout(
            self.fetch_timeout,
            self.transport.fetch_changes(peer, &request),
        )
        .await
        .unwrap_or_else(|_| Err(TransportError::Timeout(self.fetch_timeout.as_secs())))
        .map_err(SyncError::from_transport)?;

        if response.source_domain != peer.domain || response.target_domain != self.local_domain {
            return Err(SyncError::AuthenticationFailed(format!(
                "response addressed {} -> {}",
                response.source_domain, response.target_domain
            )));
        }
        response
            .verify(&peer.public_key)
            .map_err(|e| SyncError::AuthenticationFailed(format!("invalid response signature: {e}")))?;
        let skew = response.skew_from(unix_timestamp());
        if skew > self.max_clock_skew_secs {
            return Err(SyncError::AuthenticationFailed(format!(
                "response timestamp {skew}s outside clock skew window"
            )));
        }

        if response.message_type != MessageType::SyncResponse {
            return Err(SyncError::SchemaMismatch(format!(
                "expected sync_response, got {}",
                response.message_type.as_str()
            )));
        }
        let batch: ChangeBatch = serde_json::from_value(response.payload)
            .map_err(|e| SyncError::SchemaMismatch(format!("undecodable change batch: {e}")))?;
        if batch.protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::SchemaMismatch(format!(
                "protocol version {} (expected {PROTOCOL_VERSION})",
                batch.protocol_version
            )));
        }
        if batch.resource_type != resource_type {
            return Err(SyncError::SchemaMismatch(format!(
                "asked for {resource_type}, got {}",
                batch.resource_type
            )));
        }
        Ok(batch)
    }

    /// Apply one batch from a peer in a single transaction.
    ///
    /// Changes at or below the cursor were applied before and are skipped.
    /// The peer's trust level is read once, inside the transaction, so a
    /// trust change never takes effect mid-batch.
    pub async fn apply(
        &self,
        instance_id: &str,
        resource_type: &str,
        batch: &ChangeBatch,
    ) -> Result<ApplyReport, SyncError> {
        let _instance = self.locks.lock(&instance_key(instance_id)).await;

        let mut tx = self.db.begin_write().await?;
        let peer = instances::get(tx.conn(), instance_id)
            .await
            .map_err(|e| instance_not_found(e, instance_id))?;
        if !peer.active {
            return Err(SyncError::InstanceInactive(peer.id));
        }
        let cursor = sync::get_cursor(tx.conn(), instance_id, resource_type).await?;
        if cursor.as_ref().is_some_and(|c| c.status == CursorStatus::DeadLettered) {
            return Err(SyncError::Halted {
                instance_id: instance_id.to_string(),
                resource_type: resource_type.to_string(),
            });
        }

        let position = cursor.as_ref().map_or(0, |c| c.position);
        let mut report = ApplyReport {
            cursor_before: position,
            cursor_after: position,
            ..ApplyReport::default()
        };

        for change in &batch.changes {
            if change.sequence <= report.cursor_after {
                if change.sequence > position {
                    return Err(SyncError::BatchRejected(format!(
                        "sequence {} out of order after {}",
                        change.sequence, report.cursor_after
                    )));
                }
                debug!(sequence = change.sequence, "Change already applied, skipping");
                continue;
            }
            if change.resource_id.trim().is_empty() {
                return Err(SyncError::BatchRejected(format!(
                    "change {} has no resource id",
                    change.sequence
                )));
            }
            report.fields_rejected += apply_change(tx.conn(), &peer, resource_type, change).await?;
            report.changes_applied += 1;
            report.cursor_after = change.sequence;
        }

        if report.cursor_after == position {
            return Ok(report);
        }

        let now = unix_timestamp();
        sync::advance_cursor(tx.conn(), instance_id, resource_type, report.cursor_after, now)
            .await?;
        let after = sync::get_cursor(tx.conn(), instance_id, resource_type).await?;
        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(
                &Actor::System,
                AuditAction::SyncApplied,
                resource::SYNC_CURSOR,
                cursor_key(instance_id, resource_type),
            )
            .before(cursor_snapshot(cursor.as_ref()))
            .after(json!({
                "position": report.cursor_after,
                "status": after.as_ref().map(|c| c.status),
                "changes_applied": report.changes_applied,
                "fields_rejected": report.fields_rejected,
            }))
            .origin(Some(&peer.domain)),
        )
        .await?;
        tx.commit().await?;

        Ok(report)
    }

    /// Record a failed run and its side effects, then hand the error back.
    async fn fail(
        &self,
        peer: &Instance,
        resource_type: &str,
        outcome: &SyncOutcome,
        started_at: i64,
        error: SyncError,
    ) -> SyncError {
        self.set_state(&peer.id, resource_type, SessionState::Failed)
            .await;
        let reason = error.to_string();

        let status = match &error {
            SyncError::SchemaMismatch(_) => {
                if let Err(e) = self.halt(peer, resource_type, &reason).await {
                    warn!(instance_id = %peer.id, resource_type, error = %e, "Failed to halt sync");
                }
                SessionStatus::DeadLettered
            }
            SyncError::AuthenticationFailed(_) => {
                if let Err(e) = self.flag(peer, &reason).await {
                    warn!(instance_id = %peer.id, error = %e, "Failed to flag instance for review");
                }
                SessionStatus::Failed
            }
            _ => SessionStatus::Failed,
        };

        if let Err(e) = self
            .record_session(peer, resource_type, outcome, started_at, status, Some(&reason))
            .await
        {
            warn!(instance_id = %peer.id, resource_type, error = %e, "Failed to record sync session");
        }

        warn!(
            instance_id = %peer.id,
            domain = %peer.domain,
            resource_type,
            cursor = outcome.cursor_after,
            error = %reason,
            "Reconciliation failed"
        );
        error
    }

    async fn halt(&self, peer: &Instance, resource_type: &str, reason: &str) -> Result<(), SyncError> {
        let _instance = self.locks.lock(&instance_key(&peer.id)).await;
        let mut tx = self.db.begin_write().await?;
        let before = sync::get_cursor(tx.conn(), &peer.id, resource_type).await?;
        sync::set_cursor_status(
            tx.conn(),
            &peer.id,
            resource_type,
            CursorStatus::DeadLettered,
            Some(reason),
            unix_timestamp(),
        )
        .await?;
        let after = sync::get_cursor(tx.conn(), &peer.id, resource_type).await?;
        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(
                &Actor::System,
                AuditAction::SyncHalted,
                resource::SYNC_CURSOR,
                cursor_key(&peer.id, resource_type),
            )
            .before(cursor_snapshot(before.as_ref()))
            .after(cursor_snapshot(after.as_ref()))
            .origin(Some(&peer.domain))
            .reason(reason),
        )
        .await?;
        tx.commit().await?;
        warn!(instance_id = %peer.id, resource_type, reason, "Sync halted until resumed by an operator");
        Ok(())
    }

    async fn flag(&self, peer: &Instance, reason: &str) -> Result<(), SyncError> {
        let _instance = self.locks.lock(&instance_key(&peer.id)).await;
        let mut tx = self.db.begin_write().await?;
        flag_in(tx.conn(), &peer.id, &Actor::System, reason, Some(&peer.domain)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_session(
        &self,
        peer: &Instance,
        resource_type: &str,
        outcome: &SyncOutcome,
        started_at: i64,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<(), SyncError> {
        let session = SyncSession {
            id: outcome.session_id.clone(),
            instance_id: peer.id.clone(),
            resource_type: resource_type.to_string(),
            status,
            cursor_before: outcome.cursor_before,
            cursor_after: outcome.cursor_after,
            changes_applied: outcome.changes_applied,
            fields_rejected: outcome.fields_rejected,
            error: error.map(str::to_string),
            started_at,
            completed_at: unix_timestamp(),
        };
        let mut tx = self.db.begin_write().await?;
        sync::insert_session(tx.conn(), &session).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Clear a halted pair so the next run reconciles it again.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn resume(
        &self,
        instance_id: &str,
        resource_type: &str,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<SyncCursor, SyncError> {
        actor.require(Capability::FederationAdmin)?;
        let _instance = self.locks.lock(&instance_key(instance_id)).await;

        let mut tx = self.db.begin_write().await?;
        let before = sync::get_cursor(tx.conn(), instance_id, resource_type).await?;
        let Some(before) = before.filter(|c| c.status == CursorStatus::DeadLettered) else {
            return Err(SyncError::NotHalted {
                instance_id: instance_id.to_string(),
                resource_type: resource_type.to_string(),
            });
        };

        sync::set_cursor_status(
            tx.conn(),
            instance_id,
            resource_type,
            CursorStatus::Active,
            None,
            unix_timestamp(),
        )
        .await?;
        let after = sync::get_cursor(tx.conn(), instance_id, resource_type)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(cursor_key(instance_id, resource_type)))?;
        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(
                actor,
                AuditAction::SyncResumed,
                resource::SYNC_CURSOR,
                cursor_key(instance_id, resource_type),
            )
            .before(cursor_snapshot(Some(&before)))
            .after(cursor_snapshot(Some(&after)))
            .origin(origin),
        )
        .await?;
        tx.commit().await?;

        self.set_state(instance_id, resource_type, SessionState::Idle)
            .await;
        info!(instance_id = %instance_id, resource_type, position = after.position, "Sync resumed");
        Ok(after)
    }

    /// Reconcile every configured resource type with every active peer.
    pub async fn reconcile_all(&self) -> Result<SyncSummary, SyncError> {
        let peers = {
            let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
            instances::list(&mut conn, false).await?
        };

        let mut runs = JoinSet::new();
        for peer in &peers {
            for resource_type in self.resource_types.iter() {
                let engine = self.clone();
                let instance_id = peer.id.clone();
                let resource_type = resource_type.clone();
                runs.spawn(async move { engine.reconcile(&instance_id, &resource_type).await });
            }
        }

        let mut summary = SyncSummary::default();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(Ok(_)) => summary.completed += 1,
                Ok(Err(SyncError::Halted { .. } | SyncError::UnderReview(_))) => summary.halted += 1,
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Reconcile task panicked");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Run [`reconcile_all`](Self::reconcile_all) on an interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Sync engine started");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.reconcile_all().await {
                        Ok(summary) if summary.failed > 0 || summary.halted > 0 => {
                            warn!(
                                completed = summary.completed,
                                failed = summary.failed,
                                halted = summary.halted,
                                "Reconciliation round finished with failures"
                            );
                        }
                        Ok(summary) => debug!(completed = summary.completed, "Reconciliation round finished"),
                        Err(e) => warn!(error = %e, "Reconciliation round failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Sync engine shutting down");
                    return;
                }
            }
        }
    }
}

/// Apply one change's fields. Returns how many fields were rejected.
async fn apply_change(
    conn: &mut SqliteConnection,
    peer: &Instance,
    resource_type: &str,
    change: &Change,
) -> Result<i64, SyncError> {
    let existing = sync::get_record(conn, resource_type, &change.resource_id).await?;
    let (mut fields, mut versions) = match &existing {
        Some(record) => (
            serde_json::from_str::<Map<String, Value>>(&record.fields)?,
            serde_json::from_str::<BTreeMap<String, FieldVersion>>(&record.field_versions)?,
        ),
        None => (Map::new(), BTreeMap::new()),
    };

    let record_id = format!("{resource_type}/{}", change.resource_id);
    let mut rejected = 0;
    let mut changed = false;

    for (name, value) in &change.fields {
        if !accept(name, peer.trust_level) {
            rejected += 1;
            AuditLog::record_in(
                conn,
                NewAuditEntry::new(
                    &Actor::System,
                    AuditAction::SyncRejected,
                    resource::REMOTE_RECORD,
                    record_id.clone(),
                )
                .after(json!({
                    "field": name,
                    "value": value,
                    "sequence": change.sequence,
                    "peer_trust": peer.trust_level,
                }))
                .origin(Some(&peer.domain))
                .reason(format!("{name} requires a trusted peer")),
            )
            .await?;
            warn!(
                domain = %peer.domain,
                trust_level = %peer.trust_level,
                record = %record_id,
                field = %name,
                "Trust-sensitive field rejected"
            );
            continue;
        }

        let incoming = FieldVersion {
            timestamp: change.timestamp,
            trust: peer.trust_level,
            origin: peer.domain.clone(),
        };
        if resolve(versions.get(name), &incoming) {
            fields.insert(name.clone(), value.clone());
            versions.insert(name.clone(), incoming);
            changed = true;
        } else {
            debug!(record = %record_id, field = %name, "Stale field update ignored");
        }
    }

    if changed {
        sync::upsert_record(
            conn,
            &RemoteRecord {
                resource_type: resource_type.to_string(),
                resource_id: change.resource_id.clone(),
                fields: Value::Object(fields).to_string(),
                field_versions: serde_json::to_string(&versions)?,
                updated_at: unix_timestamp(),
            },
        )
        .await?;
    }
    Ok(rejected)
}

fn instance_not_found(e: DatabaseError, instance_id: &str) -> SyncError {
    match e {
        DatabaseError::NotFound(_) => SyncError::InstanceNotFound(instance_id.to_string()),
        other => other.into(),
    }
}

/// Inbound handler that starts a reconcile when a peer announces changes.
#[derive(Clone)]
pub struct SyncAvailableHandler {
    engine: SyncEngine,
}

impl SyncAvailableHandler {
    pub const fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl InboundHandler for SyncAvailableHandler {
    async fn handle(
        &self,
        source: &Instance,
        envelope: &Envelope,
    ) -> Result<Option<Value>, HandlerError> {
        if envelope.message_type != MessageType::SyncAvailable {
            return Ok(None);
        }
        let notice: SyncAvailable = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| HandlerError(format!("invalid sync_available payload: {e}")))?;
        if !self.engine.resource_types().contains(&notice.resource_type) {
            debug!(resource_type = %notice.resource_type, "Ignoring sync_available for unsynced type");
            return Ok(None);
        }
        if source.flagged_for_review {
            debug!(instance_id = %source.id, "Ignoring sync_available from peer under review");
            return Ok(None);
        }

        // A run already in progress will pick up the announced changes.
        let Some(guard) = self
            .engine
            .locks
            .try_lock(&sync_key(&source.id, &notice.resource_type))
            .await
        else {
            debug!(
                instance_id = %source.id,
                resource_type = %notice.resource_type,
                "Reconcile already running, notice coalesced"
            );
            return Ok(None);
        };

        let engine = self.engine.clone();
        let instance_id = source.id.clone();
        tokio::spawn(async move {
            let _session = guard;
            if let Err(e) = engine
                .reconcile_held(&instance_id, &notice.resource_type)
                .await
            {
                warn!(
                    instance_id = %instance_id,
                    resource_type = %notice.resource_type,
                    error = %e,
                    "Triggered reconcile failed"
                );
            }
        });
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::auth::Principal;
    use crate::registry::{InstanceRegistry, RegisterRequest};
    use crate::storage::queries_audit;
    use crate::storage::TrustLevel;
    use crate::transport::ScriptedTransport;

    struct Fixture {
        db: FederationDatabase,
        registry: InstanceRegistry,
        engine: SyncEngine,
        transport: Arc<ScriptedTransport>,
        peer_identity: SigningIdentity,
        peer: Instance,
    }

    fn admin() -> Actor {
        Actor::User(Principal::new("u1", "alice", [Capability::FederationAdmin]))
    }

    async fn fixture() -> Fixture {
        let db = FederationDatabase::open_in_memory().await.unwrap();
        let locks = KeyedLocks::new();
        let mut config = Config::default();
        config.instance.domain = "local.example".into();
        config.sync.resource_types = vec!["course".into()];

        let transport = Arc::new(ScriptedTransport::acknowledging());
        let engine = SyncEngine::new(
            db.clone(),
            locks.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(SigningIdentity::generate()),
            &config,
        );
        let registry = InstanceRegistry::new(db.clone(), locks);
        let peer_identity = SigningIdentity::generate();
        let peer = registry
            .register(
                &RegisterRequest {
                    domain: "peer.example".into(),
                    public_key: peer_identity.public_key_base64(),
                    endpoint: "https://peer.example".into(),
                    description: String::new(),
                },
                &admin(),
                None,
            )
            .await
            .unwrap();
        Fixture {
            db,
            registry,
            engine,
            transport,
            peer_identity,
            peer,
        }
    }

    fn change(sequence: i64, resource_id: &str, fields: Value, timestamp: i64) -> Change {
        Change {
            sequence,
            resource_id: resource_id.into(),
            fields: fields.as_object().cloned().unwrap(),
            timestamp,
        }
    }

    fn batch(changes: Vec<Change>, has_more: bool) -> ChangeBatch {
        ChangeBatch {
            protocol_version: PROTOCOL_VERSION,
            resource_type: "course".into(),
            changes,
            has_more,
        }
    }

    impl Fixture {
        async fn serve(&self, batch: &ChangeBatch) {
            let envelope = Envelope::new(
                uuid::Uuid::new_v4().to_string(),
                "peer.example",
                "local.example",
                MessageType::SyncResponse,
                serde_json::to_value(batch).unwrap(),
            )
            .signed(&self.peer_identity);
            self.transport.push_changes(Ok(envelope)).await;
        }

        async fn cursor(&self) -> Option<SyncCursor> {
            let mut conn = self.db.pool().acquire().await.unwrap();
            sync::get_cursor(&mut conn, &self.peer.id, "course").await.unwrap()
        }

        async fn records(&self) -> Vec<RemoteRecord> {
            let mut conn = self.db.pool().acquire().await.unwrap();
            sync::list_records(&mut conn, "course").await.unwrap()
        }

        async fn field(&self, resource_id: &str, name: &str) -> Option<Value> {
            let mut conn = self.db.pool().acquire().await.unwrap();
            let record = sync::get_record(&mut conn, "course", resource_id).await.unwrap()?;
            let fields: Map<String, Value> = serde_json::from_str(&record.fields).unwrap();
            fields.get(name).cloned()
        }

        async fn count(&self, action: &str) -> i64 {
            let mut conn = self.db.pool().acquire().await.unwrap();
            queries_audit::count_action(&mut conn, action, None).await.unwrap()
        }
    }

    #[tokio::test]
    async fn reconcile_applies_batch_and_advances_cursor() {
        let f = fixture().await;
        f.serve(&batch(
            vec![
                change(1, "c1", json!({"title": "Algebra"}), 100),
                change(2, "c2", json!({"title": "Biology"}), 101),
            ],
            false,
        ))
        .await;

        let outcome = f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        assert_eq!(outcome.cursor_before, 0);
        assert_eq!(outcome.cursor_after, 2);
        assert_eq!(outcome.changes_applied, 2);
        assert_eq!(f.cursor().await.unwrap().position, 2);
        assert_eq!(f.field("c1", "title").await, Some(json!("Algebra")));
        assert_eq!(f.count("sync-applied").await, 1);
        assert_eq!(
            f.engine.session_state(&f.peer.id, "course").await,
            SessionState::Idle
        );

        let request: SyncRequest =
            serde_json::from_value(f.transport.fetches().await[0].payload.clone()).unwrap();
        assert_eq!(request.after, 0);
        assert_eq!(request.resource_type, "course");
    }

    #[tokio::test]
    async fn follows_has_more_until_drained() {
        let f = fixture().await;
        f.serve(&batch(vec![change(1, "c1", json!({"title": "A"}), 100)], true))
            .await;
        f.serve(&batch(vec![change(2, "c2", json!({"title": "B"}), 100)], false))
            .await;

        let outcome = f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        assert_eq!(outcome.batches, 2);
        assert_eq!(outcome.cursor_after, 2);

        let fetches = f.transport.fetches().await;
        let second: SyncRequest = serde_json::from_value(fetches[1].payload.clone()).unwrap();
        assert_eq!(second.after, 1);
    }

    #[tokio::test]
    async fn replaying_the_same_batch_changes_nothing() {
        let f = fixture().await;
        let same = batch(
            vec![
                change(1, "c1", json!({"title": "Algebra", "level": 1}), 100),
                change(2, "c1", json!({"level": 2}), 101),
            ],
            false,
        );
        f.serve(&same).await;
        f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        let records = f.records().await;
        let cursor = f.cursor().await;

        f.serve(&same).await;
        let outcome = f.engine.reconcile(&f.peer.id, "course").await.unwrap();

        assert_eq!(outcome.changes_applied, 0);
        assert_eq!(f.records().await, records);
        assert_eq!(f.cursor().await, cursor);
        assert_eq!(f.count("sync-applied").await, 1);
    }

    #[tokio::test]
    async fn empty_batch_leaves_cursor_untouched() {
        let f = fixture().await;
        f.serve(&batch(vec![], false)).await;
        let outcome = f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        assert_eq!(outcome.batches, 0);
        assert!(f.cursor().await.is_none());
        assert_eq!(f.count("sync-applied").await, 0);
    }

    #[tokio::test]
    async fn trust_downgrade_rejects_sensitive_fields_from_next_batch() {
        let f = fixture().await;
        f.registry
            .set_trust_level(&f.peer.id, TrustLevel::Trusted, &admin(), None)
            .await
            .unwrap();
        f.serve(&batch(
            vec![change(1, "u1", json!({"ban_status": "banned", "name": "x"}), 100)],
            false,
        ))
        .await;
        f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        assert_eq!(f.field("u1", "ban_status").await, Some(json!("banned")));

        f.registry
            .set_trust_level(&f.peer.id, TrustLevel::Verified, &admin(), None)
            .await
            .unwrap();
        f.serve(&batch(
            vec![
                change(2, "u1", json!({"ban_status": "none", "name": "y"}), 200),
                change(3, "u2", json!({"appeal_status": "open"}), 200),
            ],
            false,
        ))
        .await;
        let outcome = f.engine.reconcile(&f.peer.id, "course").await.unwrap();

        assert_eq!(outcome.fields_rejected, 2);
        assert_eq!(f.count("sync-rejected").await, 2);
        assert_eq!(f.field("u1", "ban_status").await, Some(json!("banned")));
        assert_eq!(f.field("u1", "name").await, Some(json!("y")));
        assert_eq!(f.cursor().await.unwrap().position, 3);
    }

    #[tokio::test]
    async fn older_timestamp_does_not_overwrite() {
        let f = fixture().await;
        f.serve(&batch(
            vec![
                change(1, "c1", json!({"title": "new"}), 200),
                change(2, "c1", json!({"title": "old"}), 100),
            ],
            false,
        ))
        .await;
        f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        assert_eq!(f.field("c1", "title").await, Some(json!("new")));
        assert_eq!(f.cursor().await.unwrap().position, 2);
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_and_retry_converges() {
        let first = batch(vec![change(1, "c1", json!({"title": "A"}), 100)], false);
        let second = batch(
            vec![
                change(2, "c2", json!({"title": "B"}), 101),
                change(3, "c3", json!({"title": "C"}), 102),
            ],
            false,
        );
        let mut broken = second.clone();
        broken.changes[1].resource_id = String::new();

        let f = fixture().await;
        f.serve(&first).await;
        f.engine.reconcile(&f.peer.id, "course").await.unwrap();

        f.serve(&broken).await;
        let err = f.engine.reconcile(&f.peer.id, "course").await.unwrap_err();
        assert!(matches!(err, SyncError::BatchRejected(_)));
        assert_eq!(f.cursor().await.unwrap().position, 1);
        assert!(f.field("c2", "title").await.is_none());
        assert_eq!(
            f.engine.session_state(&f.peer.id, "course").await,
            SessionState::Failed
        );

        f.serve(&second).await;
        f.engine.reconcile(&f.peer.id, "course").await.unwrap();

        let clean = fixture().await;
        clean.serve(&first).await;
        clean.engine.reconcile(&clean.peer.id, "course").await.unwrap();
        clean.serve(&second).await;
        clean.engine.reconcile(&clean.peer.id, "course").await.unwrap();

        let strip = |records: Vec<RemoteRecord>| -> Vec<(String, String)> {
            records.into_iter().map(|r| (r.resource_id, r.fields)).collect()
        };
        assert_eq!(strip(f.records().await), strip(clean.records().await));
        assert_eq!(f.cursor().await.unwrap().position, 3);
        assert_eq!(clean.cursor().await.unwrap().position, 3);
    }

    #[tokio::test]
    async fn unreachable_peer_fails_without_side_effects() {
        let f = fixture().await;
        let err = f.engine.reconcile(&f.peer.id, "course").await.unwrap_err();
        assert!(matches!(err, SyncError::PeerUnreachable(_)));
        assert!(f.cursor().await.is_none());
        assert!(!f.registry.get(&f.peer.id).await.unwrap().flagged_for_review);

        let mut conn = f.db.pool().acquire().await.unwrap();
        let sessions = sync::list_sessions(&mut conn, &f.peer.id, 10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn forged_response_flags_peer() {
        let f = fixture().await;
        let forged = Envelope::new(
            "r1",
            "peer.example",
            "local.example",
            MessageType::SyncResponse,
            serde_json::to_value(batch(vec![change(1, "c1", json!({"t": 1}), 1)], false))
                .unwrap(),
        )
        .signed(&SigningIdentity::generate());
        f.transport.push_changes(Ok(forged)).await;

        let err = f.engine.reconcile(&f.peer.id, "course").await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        assert!(f.registry.get(&f.peer.id).await.unwrap().flagged_for_review);
        assert!(f.cursor().await.is_none());
    }

    #[tokio::test]
    async fn schema_mismatch_halts_until_resumed() {
        let f = fixture().await;
        let mut wrong = batch(vec![change(1, "c1", json!({"t": 1}), 1)], false);
        wrong.protocol_version = PROTOCOL_VERSION + 1;
        f.serve(&wrong).await;

        let err = f.engine.reconcile(&f.peer.id, "course").await.unwrap_err();
        assert!(matches!(err, SyncError::SchemaMismatch(_)));
        assert_eq!(f.cursor().await.unwrap().status, CursorStatus::DeadLettered);
        assert_eq!(f.count("sync-halted").await, 1);

        let err = f.engine.reconcile(&f.peer.id, "course").await.unwrap_err();
        assert!(matches!(err, SyncError::Halted { .. }));

        let reader = Actor::User(Principal::new("u2", "bob", [Capability::AuditRead]));
        assert!(f.engine.resume(&f.peer.id, "course", &reader, None).await.is_err());

        let cursor = f.engine.resume(&f.peer.id, "course", &admin(), None).await.unwrap();
        assert_eq!(cursor.status, CursorStatus::Active);
        assert_eq!(f.count("sync-resumed").await, 1);

        f.serve(&batch(vec![change(1, "c1", json!({"t": 1}), 1)], false)).await;
        f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        assert_eq!(f.cursor().await.unwrap().position, 1);
    }

    #[tokio::test]
    async fn resume_of_active_pair_is_rejected() {
        let f = fixture().await;
        let err = f
            .engine
            .resume(&f.peer.id, "course", &admin(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotHalted { .. }));
    }

    #[tokio::test]
    async fn flagged_peer_is_not_fetched_until_flag_cleared() {
        let f = fixture().await;
        let forged = Envelope::new(
            "r1",
            "peer.example",
            "local.example",
            MessageType::SyncResponse,
            serde_json::to_value(batch(vec![change(1, "c1", json!({"t": 1}), 1)], false))
                .unwrap(),
        )
        .signed(&SigningIdentity::generate());
        f.transport.push_changes(Ok(forged)).await;
        f.engine.reconcile(&f.peer.id, "course").await.unwrap_err();

        f.serve(&batch(vec![change(1, "c1", json!({"t": 1}), 1)], false)).await;
        let summary = f.engine.reconcile_all().await.unwrap();
        assert_eq!(summary.halted, 1);
        assert_eq!(summary.completed, 0);
        assert_eq!(f.transport.fetches().await.len(), 1);
        assert!(f.cursor().await.is_none());

        let err = f.engine.reconcile(&f.peer.id, "course").await.unwrap_err();
        assert!(matches!(err, SyncError::UnderReview(_)));

        f.registry
            .clear_review_flag(&f.peer.id, &admin(), None)
            .await
            .unwrap();
        let outcome = f.engine.reconcile(&f.peer.id, "course").await.unwrap();
        assert_eq!(outcome.cursor_after, 1);
        assert_eq!(f.transport.fetches().await.len(), 2);
    }

    fn notice(message_id: &str) -> Envelope {
        Envelope::new(
            message_id,
            "peer.example",
            "local.example",
            MessageType::SyncAvailable,
            serde_json::to_value(SyncAvailable {
                resource_type: "course".into(),
                sequence: 1,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn notices_are_coalesced_while_a_run_is_in_progress() {
        let f = fixture().await;
        let handler = SyncAvailableHandler::new(f.engine.clone());

        let held = f.engine.locks.lock(&sync_key(&f.peer.id, "course")).await;
        for n in 0..5 {
            let reply = handler.handle(&f.peer, &notice(&format!("n{n}"))).await;
            assert!(reply.unwrap().is_none());
        }
        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.transport.fetches().await.is_empty());

        f.serve(&batch(vec![change(1, "c1", json!({"t": 1}), 1)], false)).await;
        handler.handle(&f.peer, &notice("n5")).await.unwrap();
        for _ in 0..100 {
            if f.cursor().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.cursor().await.unwrap().position, 1);
        assert_eq!(f.transport.fetches().await.len(), 1);
    }

    #[tokio::test]
    async fn notices_from_flagged_peer_are_ignored() {
        let f = fixture().await;
        let handler = SyncAvailableHandler::new(f.engine.clone());
        let mut flagged = f.peer.clone();
        flagged.flagged_for_review = true;

        handler.handle(&flagged, &notice("n1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.transport.fetches().await.is_empty());
    }

    #[tokio::test]
    async fn reconcile_all_covers_every_active_peer() {
        let f = fixture().await;
        f.serve(&batch(vec![change(1, "c1", json!({"t": 1}), 1)], false)).await;
        let summary = f.engine.reconcile_all().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
    }
}
