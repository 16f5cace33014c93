//! Health and status reporting.

use serde::Serialize;

use olg_core::db::unix_timestamp;

use crate::storage::queries_instances as instances;
use crate::storage::queries_messages as messages;
use crate::storage::queries_sync as sync;
use crate::storage::{CursorStatus, DatabaseError, FederationDatabase, TrustLevel};

/// Snapshot of queue and reconciliation health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    /// Outbound messages not yet acknowledged or dead-lettered.
    pub queue_depth: i64,
    pub oldest_pending_age_secs: Option<i64>,
    pub dead_letter_count: i64,
    pub instances: Vec<InstanceHealth>,
}

/// Per-peer view, active peers only.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub domain: String,
    pub trust_level: TrustLevel,
    pub flagged_for_review: bool,
    pub last_contacted_at: Option<i64>,
    /// Completion time of the last successful reconcile of any resource type.
    pub last_reconciled_at: Option<i64>,
    pub queue_depth: i64,
    pub dead_letter_count: i64,
    /// Resource types whose sync is halted awaiting an operator.
    pub halted_resource_types: Vec<String>,
}

impl HealthReport {
    pub async fn collect(db: &FederationDatabase) -> Result<Self, DatabaseError> {
        let mut conn = db.pool().acquire().await?;
        let now = unix_timestamp();

        let totals = messages::queue_stats(&mut conn, None).await?;
        let peers = instances::list(&mut conn, false).await?;

        let mut report = Vec::with_capacity(peers.len());
        for peer in peers {
            let stats = messages::queue_stats(&mut conn, Some(&peer.id)).await?;
            let last_reconciled_at = sync::last_completed_at(&mut conn, &peer.id).await?;
            let halted_resource_types = sync::list_cursors(&mut conn, &peer.id)
                .await?
                .into_iter()
                .filter(|c| c.status == CursorStatus::DeadLettered)
                .map(|c| c.resource_type)
                .collect();

            report.push(InstanceHealth {
                instance_id: peer.id,
                domain: peer.domain,
                trust_level: peer.trust_level,
                flagged_for_review: peer.flagged_for_review,
                last_contacted_at: peer.last_contacted_at,
                last_reconciled_at,
                queue_depth: stats.depth,
                dead_letter_count: stats.dead_lettered,
                halted_resource_types,
            });
        }

        let degraded = totals.dead_lettered > 0
            || report
                .iter()
                .any(|i| i.flagged_for_review || !i.halted_resource_types.is_empty());

        Ok(Self {
            status: if degraded { "degraded" } else { "ok" },
            version: env!("CARGO_PKG_VERSION"),
            queue_depth: totals.depth,
            oldest_pending_age_secs: totals
                .oldest_open_created_at
                .map(|created| (now - created).max(0)),
            dead_letter_count: totals.dead_lettered,
            instances: report,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use olg_core::Config;
    use olg_crypto::SigningIdentity;
    use serde_json::json;

    use super::*;
    use crate::auth::{Actor, Capability, Principal};
    use crate::locks::KeyedLocks;
    use crate::queue::MessageQueue;
    use crate::registry::{InstanceRegistry, RegisterRequest};
    use crate::storage::MessageType;

    #[tokio::test]
    async fn empty_database_is_healthy() {
        let db = FederationDatabase::open_in_memory().await.unwrap();
        let report = HealthReport::collect(&db).await.unwrap();
        assert_eq!(report.status, "ok");
        assert_eq!(report.queue_depth, 0);
        assert_eq!(report.oldest_pending_age_secs, None);
        assert!(report.instances.is_empty());
    }

    #[tokio::test]
    async fn pending_messages_show_up_per_peer() {
        let db = FederationDatabase::open_in_memory().await.unwrap();
        let locks = KeyedLocks::new();
        let admin = Actor::User(Principal::new("u1", "alice", [Capability::FederationAdmin]));
        let registry = InstanceRegistry::new(db.clone(), locks.clone());
        let peer = registry
            .register(
                &RegisterRequest {
                    domain: "peer.example".into(),
                    public_key: SigningIdentity::generate().public_key_base64(),
                    endpoint: "https://peer.example".into(),
                    description: String::new(),
                },
                &admin,
                None,
            )
            .await
            .unwrap();
        let queue = MessageQueue::new(
            db.clone(),
            locks,
            Arc::new(SigningIdentity::generate()),
            &Config::default(),
        );
        for n in 0..2 {
            queue
                .enqueue(&peer.id, MessageType::Notification, json!({ "n": n }), &admin)
                .await
                .unwrap();
        }

        let report = HealthReport::collect(&db).await.unwrap();
        assert_eq!(report.queue_depth, 2);
        assert!(report.oldest_pending_age_secs.unwrap() >= 0);
        assert_eq!(report.instances.len(), 1);
        assert_eq!(report.instances[0].queue_depth, 2);
        assert_eq!(report.instances[0].last_reconciled_at, None);
    }
}
