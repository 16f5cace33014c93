//! Append-only, hash-chained audit log.
//!
//! Business mutations write their audit entry with [`AuditLog::record_in`]
//! on the same [`WriteTx`](crate::storage::WriteTx) as the mutation itself, so
//! a failing audit write aborts the mutation.

pub mod chain;

use serde::Serialize;
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument};

use olg_core::db::unix_timestamp;

use crate::auth::{Actor, AuthError, Capability};
use crate::error::{Classify, FederationErrorKind};
use crate::storage::queries_audit::{self, AuditFilter};
use crate::storage::{ActorKind, AuditEntry, AuditResult, DatabaseError, FederationDatabase};

pub use chain::{BrokenLink, ChainReport, GENESIS_HASH};

/// Resource type names used in audit entries.
pub mod resource {
    pub const INSTANCE: &str = "instance";
    pub const MESSAGE: &str = "federation_message";
    pub const SYNC_CURSOR: &str = "sync_cursor";
    pub const REMOTE_RECORD: &str = "remote_record";
    pub const LOCAL_CHANGE: &str = "local_change";
    pub const AUDIT_LOG: &str = "audit_log";
}

/// Kinds of audited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    InstanceRegistered,
    TrustLevelChanged,
    InstanceDeactivated,
    InstanceFlagged,
    InstanceFlagCleared,
    MessageEnqueued,
    MessageSent,
    MessageAcknowledged,
    MessageRetryScheduled,
    DeliveryFailed,
    MessageRequeued,
    MessageRecovered,
    MessageReceived,
    SyncApplied,
    SyncRejected,
    SyncHalted,
    SyncResumed,
    ChangePublished,
    AuditRead,
    AuditCorrection,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstanceRegistered => "instance-registered",
            Self::TrustLevelChanged => "trust-level-changed",
            Self::InstanceDeactivated => "instance-deactivated",
            Self::InstanceFlagged => "instance-flagged",
            Self::InstanceFlagCleared => "instance-flag-cleared",
            Self::MessageEnqueued => "message-enqueued",
            Self::MessageSent => "message-sent",
            Self::MessageAcknowledged => "message-acknowledged",
            Self::MessageRetryScheduled => "message-retry-scheduled",
            Self::DeliveryFailed => "delivery-failed",
            Self::MessageRequeued => "message-requeued",
            Self::MessageRecovered => "message-recovered",
            Self::MessageReceived => "message-received",
            Self::SyncApplied => "sync-applied",
            Self::SyncRejected => "sync-rejected",
            Self::SyncHalted => "sync-halted",
            Self::SyncResumed => "sync-resumed",
            Self::ChangePublished => "change-published",
            Self::AuditRead => "audit-read",
            Self::AuditCorrection => "audit-correction",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor_kind: ActorKind,
    pub actor_id: Option<String>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// Origin IP address or peer domain.
    pub origin: Option<String>,
    pub result: AuditResult,
    pub reason: Option<String>,
    pub corrects: Option<String>,
}

impl NewAuditEntry {
    pub fn new(
        actor: &Actor,
        action: AuditAction,
        resource_type: &str,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            actor_kind: actor.kind(),
            actor_id: actor.id().map(str::to_string),
            action,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.into(),
            before: None,
            after: None,
            origin: None,
            result: AuditResult::Success,
            reason: None,
            corrects: None,
        }
    }

    #[must_use]
    pub fn before(mut self, value: Value) -> Self {
        self.before = Some(value);
        self
    }

    #[must_use]
    pub fn after(mut self, value: Value) -> Self {
        self.after = Some(value);
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(str::to_string);
        self
    }

    #[must_use]
    pub const fn result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Unauthorized(#[from] AuthError),
}

impl Classify for AuditError {
    fn kind(&self) -> FederationErrorKind {
        match self {
            Self::Storage(e) => e.kind(),
            Self::Serialize(_) => FederationErrorKind::StorageFailure,
            Self::Unauthorized(e) => e.kind(),
        }
    }
}

/// Reader and writer for the audit log.
#[derive(Clone)]
pub struct AuditLog {
    db: FederationDatabase,
}

impl AuditLog {
    pub const fn new(db: FederationDatabase) -> Self {
        Self { db }
    }

    /// Append an entry inside the caller's write transaction.
    ///
    /// The caller must hold the write gate, which [`WriteTx`](crate::storage::WriteTx) does.
    pub async fn record_in(
        conn: &mut SqliteConnection,
        new: NewAuditEntry,
    ) -> Result<AuditEntry, AuditError> {
        let prev_hash = queries_audit::head_hash(conn)
            .await?
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut entry = AuditEntry {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            actor_kind: new.actor_kind,
            actor_id: new.actor_id,
            action: new.action.as_str().to_string(),
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            before_value: new.before.map(|v| v.to_string()),
            after_value: new.after.map(|v| v.to_string()),
            origin: new.origin,
            result: new.result,
            reason: new.reason,
            corrects: new.corrects,
            created_at: unix_timestamp(),
            prev_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = chain::compute_hash(&entry.prev_hash, &entry)?;
        entry.seq = queries_audit::insert(conn, &entry).await?;

        debug!(
            action = %entry.action,
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            seq = entry.seq,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Append an entry in its own transaction.
    pub async fn record(&self, new: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let mut tx = self.db.begin_write().await?;
        let entry = Self::record_in(tx.conn(), new).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Append a correction referencing an earlier entry. The original is untouched.
    #[instrument(skip(self, actor, corrected), fields(actor = %actor))]
    pub async fn correct(
        &self,
        actor: &Actor,
        original_id: &str,
        reason: &str,
        corrected: Option<Value>,
    ) -> Result<AuditEntry, AuditError> {
        actor.require(Capability::FederationAdmin)?;

        let mut tx = self.db.begin_write().await?;
        let original = queries_audit::get(tx.conn(), original_id).await?;

        let mut new = NewAuditEntry::new(
            actor,
            AuditAction::AuditCorrection,
            &original.resource_type,
            original.resource_id.clone(),
        )
        .reason(reason);
        new.before = original.after();
        new.after = corrected;
        new.corrects = Some(original.id);

        let entry = Self::record_in(tx.conn(), new).await?;
        tx.commit().await?;

        info!(corrects = %original_id, "Audit correction recorded");
        Ok(entry)
    }

    /// Query entries. Reads by anyone but the system are themselves audited.
    #[instrument(skip(self, actor, filter), fields(actor = %actor))]
    pub async fn query(
        &self,
        actor: &Actor,
        filter: &AuditFilter,
        origin: Option<&str>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        if !actor.has(Capability::AuditRead) {
            actor.require(Capability::FederationAdmin)?;
        }

        if actor.is_system() {
            let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
            return Ok(queries_audit::query(&mut conn, filter).await?);
        }

        let mut tx = self.db.begin_write().await?;
        let entries = queries_audit::query(tx.conn(), filter).await?;
        let read = NewAuditEntry::new(
            actor,
            AuditAction::AuditRead,
            resource::AUDIT_LOG,
            filter.resource_id.clone().unwrap_or_else(|| "*".to_string()),
        )
        .after(serde_json::json!({
            "filter": filter,
            "returned": entries.len(),
        }))
        .origin(origin);
        Self::record_in(tx.conn(), read).await?;
        tx.commit().await?;

        Ok(entries)
    }

    /// Walk the whole chain and report the first broken link.
    pub async fn verify_chain(&self) -> Result<ChainReport, AuditError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        let entries = queries_audit::all_in_order(&mut conn).await?;
        let report = chain::verify(&entries)?;
        if let Some(broken) = &report.first_broken {
            tracing::error!(seq = broken.seq, id = %broken.id, reason = %broken.reason, "Audit chain broken");
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::auth::Principal;

    async fn test_log() -> (FederationDatabase, AuditLog) {
        let db = FederationDatabase::open_in_memory().await.unwrap();
        (db.clone(), AuditLog::new(db))
    }

    fn admin() -> Actor {
        Actor::User(Principal::new("u1", "alice", [Capability::FederationAdmin]))
    }

    fn entry(action: AuditAction) -> NewAuditEntry {
        NewAuditEntry::new(&Actor::System, action, resource::INSTANCE, "i1")
            .after(json!({"trust_level": "unverified"}))
    }

    #[tokio::test]
    async fn record_links_entries() {
        let (_db, log) = test_log().await;
        let first = log.record(entry(AuditAction::InstanceRegistered)).await.unwrap();
        let second = log.record(entry(AuditAction::TrustLevelChanged)).await.unwrap();

        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.entry_hash);
        assert!(second.seq > first.seq);
        assert!(second.created_at >= first.created_at);
        assert_eq!(second.action, "trust-level-changed");
        assert_eq!(second.actor_kind, ActorKind::System);
        assert!(second.actor_id.is_none());

        let report = log.verify_chain().await.unwrap();
        assert!(report.is_intact());
        assert_eq!(report.entries, 2);
    }

    #[tokio::test]
    async fn record_in_rolls_back_with_its_transaction() {
        let (db, log) = test_log().await;
        {
            let mut tx = db.begin_write().await.unwrap();
            AuditLog::record_in(tx.conn(), entry(AuditAction::InstanceRegistered))
                .await
                .unwrap();
        }
        let all = log.query(&Actor::System, &AuditFilter::default(), None).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn correction_references_original() {
        let (_db, log) = test_log().await;
        let original = log.record(entry(AuditAction::TrustLevelChanged)).await.unwrap();

        let correction = log
            .correct(&admin(), &original.id, "wrong level recorded", Some(json!({"trust_level": "verified"})))
            .await
            .unwrap();
        assert_eq!(correction.action, "audit-correction");
        assert_eq!(correction.corrects.as_deref(), Some(original.id.as_str()));
        assert_eq!(correction.resource_id, "i1");
        assert_eq!(correction.before(), Some(json!({"trust_level": "unverified"})));
        assert!(log.verify_chain().await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn correction_requires_admin() {
        let (_db, log) = test_log().await;
        let original = log.record(entry(AuditAction::TrustLevelChanged)).await.unwrap();
        let peer = Actor::Instance("peer.example".into());
        let err = log.correct(&peer, &original.id, "nope", None).await.unwrap_err();
        assert_eq!(err.kind(), FederationErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn user_reads_are_audited() {
        let (_db, log) = test_log().await;
        log.record(entry(AuditAction::InstanceRegistered)).await.unwrap();

        let auditor = Actor::User(Principal::new("u2", "bob", [Capability::AuditRead]));
        let filter = AuditFilter {
            resource_id: Some("i1".into()),
            ..AuditFilter::default()
        };
        let seen = log.query(&auditor, &filter, Some("10.0.0.7")).await.unwrap();
        assert_eq!(seen.len(), 1);

        let reads = log
            .query(
                &Actor::System,
                &AuditFilter {
                    action: Some("audit-read".into()),
                    ..AuditFilter::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].actor_id.as_deref(), Some("u2"));
        assert_eq!(reads[0].origin.as_deref(), Some("10.0.0.7"));
        assert_eq!(reads[0].after().unwrap()["returned"], 1);
    }

    #[tokio::test]
    async fn system_reads_are_not_audited() {
        let (_db, log) = test_log().await;
        log.query(&Actor::System, &AuditFilter::default(), None).await.unwrap();
        let all = log.query(&Actor::System, &AuditFilter::default(), None).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn reading_requires_capability() {
        let (_db, log) = test_log().await;
        let nobody = Actor::User(Principal::new("u3", "eve", []));
        let err = log.query(&nobody, &AuditFilter::default(), None).await.unwrap_err();
        assert!(matches!(err, AuditError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_the_write() {
        let (db, log) = test_log().await;
        sqlx::query("DROP TABLE audit_log").execute(db.pool()).await.unwrap();
        let err = log.record(entry(AuditAction::InstanceRegistered)).await.unwrap_err();
        assert_eq!(err.kind(), FederationErrorKind::StorageFailure);
    }
}
