//! Inbound side of the queue: authenticated, deduplicated receipt.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use olg_core::db::unix_timestamp;

use super::{MessageQueue, QueueError};
use crate::audit::{AuditAction, AuditLog, NewAuditEntry, resource};
use crate::auth::Actor;
use crate::locks::{inbox_key, instance_key};
use crate::registry::flag_in;
use crate::storage::queries_instances as instances;
use crate::storage::queries_messages::{self as messages, NewMessage};
use crate::storage::{DatabaseError, Direction, FederationMessage, Instance, MessageStatus};
use crate::transport::{Ack, Envelope};

/// Error returned by an [`InboundHandler`] to refuse a message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Application-level processing of an authenticated inbound message.
///
/// Called at most once per (source, message id) unless it fails. The returned
/// value, if any, is stored and sent back in the ack.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(
        &self,
        source: &Instance,
        envelope: &Envelope,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Accepts every message without a response payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeOnly;

#[async_trait]
impl InboundHandler for AcknowledgeOnly {
    async fn handle(
        &self,
        _source: &Instance,
        _envelope: &Envelope,
    ) -> Result<Option<Value>, HandlerError> {
        Ok(None)
    }
}

fn stored_ack(message: &FederationMessage) -> Result<Option<Ack>, QueueError> {
    if message.status != MessageStatus::Acknowledged {
        return Ok(None);
    }
    match message.ack_payload.as_deref() {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

impl MessageQueue {
    /// Authenticate and accept an envelope from a peer.
    ///
    /// A message id already acknowledged for the same source returns the
    /// original ack without running the handler again.
    #[instrument(skip(self, envelope), fields(message_id = %envelope.id, source = %envelope.source_domain))]
    pub async fn receive(&self, envelope: &Envelope, origin: Option<&str>) -> Result<Ack, QueueError> {
        let source = self.authenticate(envelope).await?;

        let _guard = self.locks.lock(&inbox_key(&source.id, &envelope.id)).await;

        if let Some(ack) = self.prior_ack(&source, &envelope.id).await? {
            debug!(message_id = %envelope.id, "Duplicate inbound message, returning prior ack");
            return Ok(ack);
        }

        let response = self.handler.handle(&source, envelope).await.map_err(|e| {
            warn!(message_id = %envelope.id, source = %source.domain, error = %e, "Inbound message rejected");
            QueueError::Rejected(e.0)
        })?;

        let now = unix_timestamp();
        let ack = Ack {
            message_id: envelope.id.clone(),
            receiver: self.local_domain.clone(),
            received_at: now,
            payload: response,
        };
        let ack_json = serde_json::to_string(&ack)?;
        let payload_json = envelope.payload.to_string();

        let _instance = self.locks.lock(&instance_key(&source.id)).await;
        let mut tx = self.db.begin_write().await?;
        let inserted = messages::insert(
            tx.conn(),
            &NewMessage {
                message_id: &envelope.id,
                direction: Direction::Inbound,
                instance_id: &source.id,
                message_type: envelope.message_type,
                payload: &payload_json,
                signature: &envelope.signature,
                status: MessageStatus::Acknowledged,
                ack_payload: Some(&ack_json),
                now,
            },
        )
        .await;

        let message = match inserted {
            Ok(message) => message,
            Err(DatabaseError::Conflict(_)) => {
                drop(tx);
                if let Some(ack) = self.prior_ack(&source, &envelope.id).await? {
                    return Ok(ack);
                }
                return Err(QueueError::Storage(DatabaseError::Conflict(format!(
                    "inbound message {} already stored",
                    envelope.id
                ))));
            }
            Err(e) => return Err(e.into()),
        };

        instances::touch_last_contacted(tx.conn(), &source.id, now).await?;
        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(
                &Actor::Instance(source.domain.clone()),
                AuditAction::MessageReceived,
                resource::MESSAGE,
                message.message_id.clone(),
            )
            .after(json!({
                "instance_id": source.id,
                "type": message.message_type,
                "status": message.status,
            }))
            .origin(origin),
        )
        .await?;
        tx.commit().await?;

        info!(
            message_id = %envelope.id,
            source = %source.domain,
            message_type = envelope.message_type.as_str(),
            "Inbound message acknowledged"
        );
        Ok(ack)
    }

    /// Resolve the source, check addressing, signature and clock skew.
    ///
    /// A bad signature from a registered peer flags it for review.
    pub(crate) async fn authenticate(&self, envelope: &Envelope) -> Result<Instance, QueueError> {
        let source = {
            let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
            instances::find_active_by_domain(&mut conn, &envelope.source_domain).await?
        }
        .ok_or_else(|| QueueError::UnknownSource(envelope.source_domain.clone()))?;

        if envelope.target_domain != self.local_domain {
            return Err(QueueError::WrongTarget(envelope.target_domain.clone()));
        }

        if let Err(e) = envelope.verify(&source.public_key) {
            let reason = format!("invalid envelope signature on {}: {e}", envelope.id);
            let _instance = self.locks.lock(&instance_key(&source.id)).await;
            let mut tx = self.db.begin_write().await?;
            flag_in(tx.conn(), &source.id, &Actor::System, &reason, None).await?;
            tx.commit().await?;
            return Err(QueueError::BadSignature(e.to_string()));
        }

        let skew = envelope.skew_from(unix_timestamp());
        if skew > self.max_clock_skew_secs {
            warn!(source = %source.domain, skew, "Envelope outside clock skew window");
            return Err(QueueError::ClockSkew { skew_secs: skew });
        }

        Ok(source)
    }

    async fn prior_ack(&self, source: &Instance, message_id: &str) -> Result<Option<Ack>, QueueError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        match messages::find(&mut conn, Direction::Inbound, &source.id, message_id).await? {
            Some(existing) => stored_ack(&existing),
            None => Ok(None),
        }
    }
}
