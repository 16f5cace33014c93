//! Per-peer queue drain and the scheduling loop around it.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use olg_core::Config;
use olg_core::db::unix_timestamp;

use crate::locks::{KeyedLocks, delivery_key};
use crate::queue::{AttemptOutcome, MessageQueue, QueueError};
use crate::storage::queries_instances as instances;
use crate::storage::queries_messages as messages;
use crate::storage::{DatabaseError, FederationDatabase};
use crate::transport::{Transport, TransportError};

/// Counters from one or more drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: u64,
    pub acknowledged: u64,
    pub retry_scheduled: u64,
    pub dead_lettered: u64,
}

impl AddAssign for DrainReport {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.acknowledged += other.acknowledged;
        self.retry_scheduled += other.retry_scheduled;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Drives outbound messages through the transport.
#[derive(Clone)]
pub struct DeliveryEngine {
    db: FederationDatabase,
    queue: MessageQueue,
    transport: Arc<dyn Transport>,
    locks: KeyedLocks,
    send_timeout: Duration,
    tick_interval: Duration,
}

impl DeliveryEngine {
    pub fn new(
        db: FederationDatabase,
        queue: MessageQueue,
        transport: Arc<dyn Transport>,
        locks: KeyedLocks,
        config: &Config,
    ) -> Self {
        Self {
            db,
            queue,
            transport,
            locks,
            send_timeout: Duration::from_secs(config.delivery.send_timeout_secs),
            tick_interval: Duration::from_secs(config.delivery.tick_interval_secs.max(1)),
        }
    }

    /// Send every due message to one peer, oldest first.
    ///
    /// Returns immediately with an empty report if another drain for the
    /// same peer is running. Stops at the first message that is scheduled
    /// for a retry so nothing behind it is sent early.
    #[instrument(skip(self))]
    pub async fn drain_peer(&self, instance_id: &str) -> Result<DrainReport, QueueError> {
        let mut report = DrainReport::default();
        let Some(_guard) = self.locks.try_lock(&delivery_key(instance_id)).await else {
            debug!(instance_id = %instance_id, "Drain already running for peer");
            return Ok(report);
        };

        let peer = {
            let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
            instances::get(&mut conn, instance_id).await?
        };
        if !peer.active {
            return Ok(report);
        }

        while let Some(message) = self.queue.next_due(instance_id, unix_timestamp()).await? {
            let Some(sent) = self.queue.begin_attempt(&message).await? else {
                break;
            };
            report.attempted += 1;

            let result = match self.queue.envelope_for(&sent, &peer) {
                Ok(envelope) => {
                    match tokio::time::timeout(
                        self.send_timeout,
                        self.transport.send(&peer, &envelope),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout(self.send_timeout.as_secs())),
                    }
                }
                Err(e) => Err(TransportError::Protocol(format!("unsendable payload: {e}"))),
            };

            match self.queue.complete_attempt(&sent, result).await? {
                AttemptOutcome::Acknowledged => {
                    report.acknowledged += 1;
                    debug!(message_id = %sent.message_id, "Message acknowledged");
                }
                AttemptOutcome::DeadLettered { .. } => report.dead_lettered += 1,
                AttemptOutcome::RetryScheduled { .. } => {
                    report.retry_scheduled += 1;
                    break;
                }
                AttemptOutcome::Skipped => break,
            }
        }

        if report.attempted > 0 {
            info!(
                instance_id = %instance_id,
                domain = %peer.domain,
                attempted = report.attempted,
                acknowledged = report.acknowledged,
                retry_scheduled = report.retry_scheduled,
                dead_lettered = report.dead_lettered,
                "Peer queue drained"
            );
        }
        Ok(report)
    }

    /// Drain every peer with open messages, concurrently across peers.
    pub async fn tick(&self) -> Result<DrainReport, QueueError> {
        let peers = {
            let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
            messages::peers_with_open_outbound(&mut conn).await?
        };

        let mut drains = JoinSet::new();
        for instance_id in peers {
            let engine = self.clone();
            drains.spawn(async move {
                let result = engine.drain_peer(&instance_id).await;
                (instance_id, result)
            });
        }

        let mut total = DrainReport::default();
        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok((_, Ok(report))) => total += report,
                Ok((instance_id, Err(e))) => {
                    warn!(instance_id = %instance_id, error = %e, "Peer drain failed");
                }
                Err(e) => warn!(error = %e, "Peer drain task panicked"),
            }
        }

        self.locks.prune().await;
        Ok(total)
    }

    /// Run [`tick`](Self::tick) on an interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.tick_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.tick_interval.as_secs(), "Delivery engine started");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Delivery tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Delivery engine shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use olg_crypto::SigningIdentity;

    use super::*;
    use crate::auth::{Actor, Capability, Principal};
    use crate::registry::{InstanceRegistry, RegisterRequest};
    use crate::storage::queries_audit;
    use crate::storage::queries_messages::MessageFilter;
    use crate::storage::{Instance, MessageStatus, MessageType};
    use crate::transport::{Ack, ScriptedTransport};

    fn admin() -> Actor {
        Actor::User(Principal::new("u1", "alice", [Capability::FederationAdmin]))
    }

    struct Fixture {
        db: FederationDatabase,
        registry: InstanceRegistry,
        queue: MessageQueue,
        engine: DeliveryEngine,
        transport: Arc<ScriptedTransport>,
    }

    async fn fixture(transport: ScriptedTransport) -> Fixture {
        let db = FederationDatabase::open_in_memory().await.unwrap();
        let locks = KeyedLocks::new();
        let mut config = Config::default();
        config.instance.domain = "local.example".into();
        config.delivery.base_backoff_secs = 0;
        config.delivery.max_attempts = 3;
        config.delivery.send_timeout_secs = 1;

        let queue = MessageQueue::new(
            db.clone(),
            locks.clone(),
            Arc::new(SigningIdentity::generate()),
            &config,
        );
        let transport = Arc::new(transport);
        let engine = DeliveryEngine::new(
            db.clone(),
            queue.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            locks.clone(),
            &config,
        );
        Fixture {
            registry: InstanceRegistry::new(db.clone(), locks),
            db,
            queue,
            engine,
            transport,
        }
    }

    async fn peer(f: &Fixture, domain: &str) -> Instance {
        f.registry
            .register(
                &RegisterRequest {
                    domain: domain.into(),
                    public_key: SigningIdentity::generate().public_key_base64(),
                    endpoint: format!("https://{domain}"),
                    description: String::new(),
                },
                &admin(),
                None,
            )
            .await
            .unwrap()
    }

    async fn enqueue(f: &Fixture, peer: &Instance, n: u32) -> String {
        f.queue
            .enqueue(&peer.id, MessageType::Notification, json!({ "n": n }), &admin())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn retry_blocks_later_messages_until_head_succeeds() {
        let f = fixture(ScriptedTransport::acknowledging()).await;
        let p = peer(&f, "peer.example").await;
        let first = enqueue(&f, &p, 1).await;
        let second = enqueue(&f, &p, 2).await;
        let third = enqueue(&f, &p, 3).await;

        f.transport
            .push_send(Err(TransportError::Unreachable("down".into())))
            .await;

        let report = f.engine.drain_peer(&p.id).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.retry_scheduled, 1);

        let report = f.engine.drain_peer(&p.id).await.unwrap();
        assert_eq!(report.acknowledged, 3);

        let order: Vec<String> = f.transport.sent().await.into_iter().map(|e| e.id).collect();
        assert_eq!(order, vec![first.clone(), first, second, third]);
    }

    #[tokio::test]
    async fn exhausted_head_is_dead_lettered_and_drain_moves_on() {
        let f = fixture(ScriptedTransport::acknowledging()).await;
        let p = peer(&f, "peer.example").await;
        enqueue(&f, &p, 1).await;
        enqueue(&f, &p, 2).await;

        for _ in 0..3 {
            f.transport
                .push_send(Err(TransportError::Unreachable("down".into())))
                .await;
        }

        let mut total = DrainReport::default();
        for _ in 0..3 {
            total += f.engine.drain_peer(&p.id).await.unwrap();
        }
        assert_eq!(total.dead_lettered, 1);
        assert_eq!(total.acknowledged, 1);

        let stats = f.queue.stats(Some(&p.id)).await.unwrap();
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn send_timeout_counts_as_failed_attempt() {
        let f = fixture(ScriptedTransport::hanging()).await;
        let p = peer(&f, "peer.example").await;
        enqueue(&f, &p, 1).await;

        let report = f.engine.drain_peer(&p.id).await.unwrap();
        assert_eq!(report.retry_scheduled, 1);

        let messages = f
            .queue
            .list(&messages::MessageFilter {
                instance_id: Some(p.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(messages[0].status, MessageStatus::Failed);
        assert!(messages[0].last_error.as_deref().unwrap().contains("1s"));
    }

    #[tokio::test]
    async fn concurrent_drain_of_same_peer_is_skipped() {
        let f = fixture(ScriptedTransport::hanging()).await;
        let p = peer(&f, "peer.example").await;
        enqueue(&f, &p, 1).await;

        let engine = f.engine.clone();
        let id = p.id.clone();
        let running = tokio::spawn(async move { engine.drain_peer(&id).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = f.engine.drain_peer(&p.id).await.unwrap();
        assert_eq!(second, DrainReport::default());

        let first = running.await.unwrap().unwrap();
        assert_eq!(first.attempted, 1);
        assert_eq!(f.transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn tick_drains_peers_independently() {
        let f = fixture(ScriptedTransport::acknowledging()).await;
        let a = peer(&f, "a.example").await;
        let b = peer(&f, "b.example").await;
        enqueue(&f, &a, 1).await;
        enqueue(&f, &b, 1).await;
        enqueue(&f, &b, 2).await;

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.acknowledged, 3);
        assert_eq!(f.queue.stats(None).await.unwrap().depth, 0);
    }

    #[tokio::test]
    async fn deactivated_peer_is_not_drained() {
        let f = fixture(ScriptedTransport::acknowledging()).await;
        let p = peer(&f, "peer.example").await;
        enqueue(&f, &p, 1).await;
        f.registry.deactivate(&p.id, &admin(), None).await.unwrap();

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(f.transport.sent().await.is_empty());
        assert_eq!(f.queue.stats(Some(&p.id)).await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn deactivation_dead_letters_in_flight_message() {
        let f = fixture(ScriptedTransport::acknowledging()).await;
        let p = peer(&f, "peer.example").await;
        let message_id = enqueue(&f, &p, 1).await;

        let pending = f
            .queue
            .list(&MessageFilter {
                instance_id: Some(p.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .remove(0);
        let sent = f.queue.begin_attempt(&pending).await.unwrap().unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);

        f.registry.deactivate(&p.id, &admin(), None).await.unwrap();
        assert_eq!(
            f.queue.get(sent.seq).await.unwrap().status,
            MessageStatus::DeadLettered
        );

        // The peer answers after the deactivation; the late ack changes nothing.
        let ack = Ack {
            message_id: message_id.clone(),
            receiver: "peer.example".into(),
            received_at: 0,
            payload: None,
        };
        let outcome = f.queue.complete_attempt(&sent, Ok(ack)).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Skipped);
        assert_eq!(
            f.queue.get(sent.seq).await.unwrap().status,
            MessageStatus::DeadLettered
        );

        let mut conn = f.db.pool().acquire().await.unwrap();
        let failed = queries_audit::count_action(&mut conn, "delivery-failed", Some(&message_id))
            .await
            .unwrap();
        assert_eq!(failed, 1);
        let acked = queries_audit::count_action(&mut conn, "message-acknowledged", None)
            .await
            .unwrap();
        assert_eq!(acked, 0);
    }
}
