//! The local change feed peers reconcile against.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};

use olg_core::Config;
use olg_core::db::unix_timestamp;
use olg_crypto::SigningIdentity;

use super::SyncError;
use super::types::{Change, ChangeBatch, PROTOCOL_VERSION, SyncAvailable, SyncRequest};
use crate::audit::{AuditAction, AuditLog, NewAuditEntry, resource};
use crate::auth::{Actor, Capability};
use crate::queue::MessageQueue;
use crate::storage::queries_sync as sync;
use crate::storage::{DatabaseError, FederationDatabase, LocalChange, MessageType};
use crate::transport::Envelope;

/// Publishes local changes and serves them to peers.
#[derive(Clone)]
pub struct ChangeFeed {
    db: FederationDatabase,
    queue: MessageQueue,
    identity: Arc<SigningIdentity>,
    local_domain: String,
    batch_limit: u32,
}

impl ChangeFeed {
    pub fn new(
        db: FederationDatabase,
        queue: MessageQueue,
        identity: Arc<SigningIdentity>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            queue,
            identity,
            local_domain: config.instance.domain.clone(),
            batch_limit: config.sync.batch_limit.max(1),
        }
    }

    /// Append a change to the feed and notify every active peer.
    ///
    /// The change, its audit entry and the `sync_available` messages commit
    /// together.
    #[instrument(skip(self, fields, actor), fields(actor = %actor))]
    pub async fn publish(
        &self,
        resource_type: &str,
        resource_id: &str,
        fields: Map<String, Value>,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<LocalChange, SyncError> {
        actor.require(Capability::FederationAdmin)?;
        if resource_type.trim().is_empty() || resource_id.trim().is_empty() {
            return Err(SyncError::BatchRejected(
                "resource type and id are required".to_string(),
            ));
        }

        let fields_json = Value::Object(fields).to_string();
        let mut tx = self.db.begin_write().await?;
        let change = sync::insert_local_change(
            tx.conn(),
            resource_type,
            resource_id,
            &fields_json,
            unix_timestamp(),
        )
        .await?;

        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(
                actor,
                AuditAction::ChangePublished,
                resource::LOCAL_CHANGE,
                change.sequence.to_string(),
            )
            .after(json!({
                "resource_type": change.resource_type,
                "resource_id": change.resource_id,
                "fields": serde_json::from_str::<Value>(&change.fields)?,
            }))
            .origin(origin),
        )
        .await?;

        let notice = serde_json::to_value(SyncAvailable {
            resource_type: change.resource_type.clone(),
            sequence: change.sequence,
        })?;
        let notified = self
            .queue
            .enqueue_for_all_in(tx.conn(), MessageType::SyncAvailable, &notice, actor)
            .await?;
        tx.commit().await?;

        info!(
            resource_type = %change.resource_type,
            resource_id = %change.resource_id,
            sequence = change.sequence,
            peers_notified = notified.len(),
            "Local change published"
        );
        Ok(change)
    }

    /// Changes of a type strictly after `request.after`, at most one batch.
    pub async fn changes_since(&self, request: &SyncRequest) -> Result<ChangeBatch, SyncError> {
        let limit = request.limit.clamp(1, self.batch_limit);
        let mut rows = {
            let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
            sync::local_changes_since(
                &mut conn,
                &request.resource_type,
                request.after,
                i64::from(limit) + 1,
            )
            .await?
        };

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);

        let changes = rows
            .into_iter()
            .map(|row| {
                Ok(Change {
                    sequence: row.sequence,
                    resource_id: row.resource_id,
                    fields: serde_json::from_str(&row.fields)?,
                    timestamp: row.changed_at,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        Ok(ChangeBatch {
            protocol_version: PROTOCOL_VERSION,
            resource_type: request.resource_type.clone(),
            changes,
            has_more,
        })
    }

    /// Answer a peer's signed `sync_request` with a signed `sync_response`.
    pub async fn serve(&self, request: &Envelope) -> Result<Envelope, SyncError> {
        let source = self.queue.authenticate(request).await?;
        if request.message_type != MessageType::SyncRequest {
            return Err(SyncError::SchemaMismatch(format!(
                "expected sync_request, got {}",
                request.message_type.as_str()
            )));
        }
        let sync_request: SyncRequest = serde_json::from_value(request.payload.clone())
            .map_err(|e| SyncError::SchemaMismatch(format!("undecodable sync_request: {e}")))?;

        let batch = self.changes_since(&sync_request).await?;
        debug!(
            peer = %source.domain,
            resource_type = %batch.resource_type,
            after = sync_request.after,
            returned = batch.changes.len(),
            has_more = batch.has_more,
            "Serving change batch"
        );

        Ok(Envelope::new(
            uuid::Uuid::new_v4().to_string(),
            self.local_domain.clone(),
            source.domain,
            MessageType::SyncResponse,
            serde_json::to_value(&batch)?,
        )
        .signed(&self.identity))
    }
}
