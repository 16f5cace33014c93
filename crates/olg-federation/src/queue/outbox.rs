//! Outbound side of the queue.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use olg_core::db::unix_timestamp;

use super::{MessageQueue, QueueError};
use crate::audit::{AuditAction, AuditLog, NewAuditEntry, resource};
use crate::auth::{Actor, Capability};
use crate::error::{Classify, FederationErrorKind};
use crate::locks::instance_key;
use crate::registry::flag_in;
use crate::storage::queries_instances as instances;
use crate::storage::queries_messages::{self as messages, MessageFilter, NewMessage, QueueStats};
use crate::storage::{
    DatabaseError, Direction, FederationMessage, Instance, MessageStatus, MessageType,
};
use crate::transport::{Ack, Envelope, TransportError};

/// Body of an operator-initiated message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Value,
}

/// What happened to a message after a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Acknowledged,
    RetryScheduled { next_attempt_at: i64 },
    DeadLettered { reason: String },
    /// The message changed status concurrently; nothing was written.
    Skipped,
}

fn message_snapshot(message: &FederationMessage) -> Value {
    json!({
        "instance_id": message.instance_id,
        "type": message.message_type,
        "status": message.status,
        "attempts": message.attempts,
        "next_attempt_at": message.next_attempt_at,
    })
}

fn message_entry(actor: &Actor, action: AuditAction, message: &FederationMessage) -> NewAuditEntry {
    NewAuditEntry::new(actor, action, resource::MESSAGE, message.message_id.clone())
}

fn attempts_of(message: &FederationMessage) -> u32 {
    u32::try_from(message.attempts).unwrap_or(u32::MAX)
}

impl MessageQueue {
    /// Store a signed `pending` message for a peer and return its id.
    #[instrument(skip(self, payload, actor), fields(actor = %actor))]
    pub async fn enqueue(
        &self,
        instance_id: &str,
        message_type: MessageType,
        payload: Value,
        actor: &Actor,
    ) -> Result<String, QueueError> {
        let mut tx = self.db.begin_write().await?;
        let instance = instances::get(tx.conn(), instance_id)
            .await
            .map_err(|e| instance_not_found(e, instance_id))?;
        let message = self
            .enqueue_in(tx.conn(), &instance, message_type, &payload, actor)
            .await?;
        tx.commit().await?;

        info!(
            message_id = %message.message_id,
            instance_id = %instance_id,
            message_type = message_type.as_str(),
            "Message enqueued"
        );
        Ok(message.message_id)
    }

    /// Enqueue the same payload to every active peer in one transaction.
    pub async fn enqueue_for_all(
        &self,
        message_type: MessageType,
        payload: Value,
        actor: &Actor,
    ) -> Result<Vec<String>, QueueError> {
        let mut tx = self.db.begin_write().await?;
        let ids = self
            .enqueue_for_all_in(tx.conn(), message_type, &payload, actor)
            .await?;
        tx.commit().await?;
        Ok(ids)
    }

    pub(crate) async fn enqueue_for_all_in(
        &self,
        conn: &mut SqliteConnection,
        message_type: MessageType,
        payload: &Value,
        actor: &Actor,
    ) -> Result<Vec<String>, QueueError> {
        let peers = instances::list(conn, false).await?;
        let mut ids = Vec::with_capacity(peers.len());
        for peer in &peers {
            let message = self
                .enqueue_in(conn, peer, message_type, payload, actor)
                .await?;
            ids.push(message.message_id);
        }
        Ok(ids)
    }

    /// Insert and audit a pending message inside the caller's transaction.
    pub(crate) async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        instance: &Instance,
        message_type: MessageType,
        payload: &Value,
        actor: &Actor,
    ) -> Result<FederationMessage, QueueError> {
        if !instance.active {
            return Err(QueueError::InstanceInactive(instance.id.clone()));
        }

        let envelope = Envelope::new(
            uuid::Uuid::new_v4().to_string(),
            self.local_domain.clone(),
            instance.domain.clone(),
            message_type,
            payload.clone(),
        )
        .signed(&self.identity);
        let payload_json = envelope.payload.to_string();

        let message = messages::insert(
            conn,
            &NewMessage {
                message_id: &envelope.id,
                direction: Direction::Outbound,
                instance_id: &instance.id,
                message_type,
                payload: &payload_json,
                signature: &envelope.signature,
                status: MessageStatus::Pending,
                ack_payload: None,
                now: unix_timestamp(),
            },
        )
        .await?;

        AuditLog::record_in(
            conn,
            message_entry(actor, AuditAction::MessageEnqueued, &message)
                .after(message_snapshot(&message)),
        )
        .await?;
        Ok(message)
    }

    /// Put a dead-lettered message back in the queue with a fresh attempt budget.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn requeue(
        &self,
        seq: i64,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<FederationMessage, QueueError> {
        actor.require(Capability::FederationAdmin)?;

        let mut tx = self.db.begin_write().await?;
        let before = messages::get(tx.conn(), seq)
            .await
            .map_err(|e| message_not_found(e, seq))?;
        if before.direction != Direction::Outbound || before.status != MessageStatus::DeadLettered {
            return Err(QueueError::NotDeadLettered(before.message_id));
        }
        let instance = instances::get(tx.conn(), &before.instance_id).await?;
        if !instance.active {
            return Err(QueueError::InstanceInactive(instance.id));
        }

        messages::requeue(tx.conn(), seq, unix_timestamp()).await?;
        let after = messages::get(tx.conn(), seq).await?;
        AuditLog::record_in(
            tx.conn(),
            message_entry(actor, AuditAction::MessageRequeued, &after)
                .before(message_snapshot(&before))
                .after(message_snapshot(&after))
                .origin(origin),
        )
        .await?;
        tx.commit().await?;

        info!(message_id = %after.message_id, instance_id = %after.instance_id, "Message requeued");
        Ok(after)
    }

    /// Return messages left `sent` by a crash to `failed` so they are retried.
    pub async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut tx = self.db.begin_write().await?;
        let now = unix_timestamp();
        let stuck = messages::in_flight(tx.conn()).await?;
        let mut recovered = 0usize;
        for before in &stuck {
            if !messages::mark_failed(
                tx.conn(),
                before.seq,
                "interrupted before acknowledgement",
                now,
                now,
            )
            .await?
            {
                continue;
            }
            let after = messages::get(tx.conn(), before.seq).await?;
            AuditLog::record_in(
                tx.conn(),
                message_entry(&Actor::System, AuditAction::MessageRecovered, &after)
                    .before(message_snapshot(before))
                    .after(message_snapshot(&after)),
            )
            .await?;
            recovered += 1;
        }
        tx.commit().await?;

        if recovered > 0 {
            warn!(recovered, "Recovered in-flight messages after restart");
        }
        Ok(recovered)
    }

    /// The peer's head-of-line message if it is due at `now`.
    ///
    /// Returns `None` while the head is in flight or backing off, so later
    /// messages never overtake it.
    pub async fn next_due(
        &self,
        instance_id: &str,
        now: i64,
    ) -> Result<Option<FederationMessage>, QueueError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        let head = messages::head_of_line(&mut conn, instance_id).await?;
        Ok(head.filter(|m| m.status != MessageStatus::Sent && m.next_attempt_at <= now))
    }

    /// Envelope for a delivery attempt, signed with a fresh timestamp.
    pub fn envelope_for(
        &self,
        message: &FederationMessage,
        peer: &Instance,
    ) -> Result<Envelope, QueueError> {
        let payload: Value = serde_json::from_str(&message.payload)?;
        let mut envelope = Envelope::new(
            message.message_id.clone(),
            self.local_domain.clone(),
            peer.domain.clone(),
            message.message_type,
            payload,
        );
        envelope.sign(&self.identity);
        Ok(envelope)
    }

    /// Mark a message `sent` and count the attempt. `None` if it was no longer sendable.
    pub async fn begin_attempt(
        &self,
        message: &FederationMessage,
    ) -> Result<Option<FederationMessage>, QueueError> {
        let mut tx = self.db.begin_write().await?;
        if !messages::mark_sent(tx.conn(), message.seq, unix_timestamp()).await? {
            return Ok(None);
        }
        let sent = messages::get(tx.conn(), message.seq).await?;
        AuditLog::record_in(
            tx.conn(),
            message_entry(&Actor::System, AuditAction::MessageSent, &sent)
                .before(message_snapshot(message))
                .after(message_snapshot(&sent)),
        )
        .await?;
        tx.commit().await?;
        Ok(Some(sent))
    }

    /// Record the result of an attempt started with [`begin_attempt`](Self::begin_attempt).
    ///
    /// Holds the peer's instance lock, since the outcome may touch the
    /// instance row (last contact, review flag).
    pub async fn complete_attempt(
        &self,
        sent: &FederationMessage,
        result: Result<Ack, TransportError>,
    ) -> Result<AttemptOutcome, QueueError> {
        let now = unix_timestamp();
        let _instance = self.locks.lock(&instance_key(&sent.instance_id)).await;
        let mut tx = self.db.begin_write().await?;

        let outcome = match result {
            Ok(ack) => {
                let ack_json = serde_json::to_string(&ack)?;
                if !messages::mark_acknowledged(tx.conn(), sent.seq, &ack_json, now).await? {
                    return Ok(AttemptOutcome::Skipped);
                }
                instances::touch_last_contacted(tx.conn(), &sent.instance_id, now).await?;
                let after = messages::get(tx.conn(), sent.seq).await?;
                AuditLog::record_in(
                    tx.conn(),
                    message_entry(&Actor::System, AuditAction::MessageAcknowledged, &after)
                        .before(message_snapshot(sent))
                        .after(message_snapshot(&after)),
                )
                .await?;
                AttemptOutcome::Acknowledged
            }
            Err(error) => {
                let kind = error.kind();
                let attempts = attempts_of(sent);
                let reason = error.to_string();

                if kind.is_retryable() && !self.policy.is_exhausted(attempts) {
                    let delay = i64::try_from(self.policy.delay_for_attempt(attempts))
                        .unwrap_or(i64::MAX);
                    let next_attempt_at = now.saturating_add(delay);
                    if !messages::mark_failed(tx.conn(), sent.seq, &reason, next_attempt_at, now)
                        .await?
                    {
                        return Ok(AttemptOutcome::Skipped);
                    }
                    let after = messages::get(tx.conn(), sent.seq).await?;
                    AuditLog::record_in(
                        tx.conn(),
                        message_entry(&Actor::System, AuditAction::MessageRetryScheduled, &after)
                            .before(message_snapshot(sent))
                            .after(message_snapshot(&after))
                            .reason(&reason),
                    )
                    .await?;
                    warn!(
                        message_id = %sent.message_id,
                        instance_id = %sent.instance_id,
                        attempts,
                        next_attempt_at,
                        error = %reason,
                        "Delivery failed, retry scheduled"
                    );
                    AttemptOutcome::RetryScheduled { next_attempt_at }
                } else {
                    let reason = if kind.is_retryable() {
                        format!("max attempts ({attempts}) exhausted: {reason}")
                    } else {
                        reason
                    };
                    if !messages::mark_dead_lettered(tx.conn(), sent.seq, &reason, now).await? {
                        return Ok(AttemptOutcome::Skipped);
                    }
                    let after = messages::get(tx.conn(), sent.seq).await?;
                    AuditLog::record_in(
                        tx.conn(),
                        message_entry(&Actor::System, AuditAction::DeliveryFailed, &after)
                            .before(message_snapshot(sent))
                            .after(message_snapshot(&after))
                            .reason(&reason),
                    )
                    .await?;
                    if kind == FederationErrorKind::AuthFailure {
                        flag_in(tx.conn(), &sent.instance_id, &Actor::System, &reason, None).await?;
                    }
                    warn!(
                        message_id = %sent.message_id,
                        instance_id = %sent.instance_id,
                        attempts,
                        error = %reason,
                        "Message dead-lettered"
                    );
                    AttemptOutcome::DeadLettered { reason }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// A message by its local sequence number.
    pub async fn get(&self, seq: i64) -> Result<FederationMessage, QueueError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        messages::get(&mut conn, seq)
            .await
            .map_err(|e| message_not_found(e, seq))
    }

    pub async fn list(&self, filter: &MessageFilter) -> Result<Vec<FederationMessage>, QueueError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        Ok(messages::list(&mut conn, filter).await?)
    }

    /// Outbound counters, for all peers or one.
    pub async fn stats(&self, instance_id: Option<&str>) -> Result<QueueStats, QueueError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        Ok(messages::queue_stats(&mut conn, instance_id).await?)
    }
}

fn instance_not_found(e: DatabaseError, instance_id: &str) -> QueueError {
    match e {
        DatabaseError::NotFound(_) => QueueError::InstanceNotFound(instance_id.to_string()),
        other => other.into(),
    }
}

fn message_not_found(e: DatabaseError, seq: i64) -> QueueError {
    match e {
        DatabaseError::NotFound(_) => QueueError::NotFound(format!("#{seq}")),
        other => other.into(),
    }
}
