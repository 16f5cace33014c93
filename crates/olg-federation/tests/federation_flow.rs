#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end flows across the registry, queue, delivery engine, sync and
//! audit log, wired through `FederationService`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use olg_core::Config;
use olg_crypto::SigningIdentity;
use olg_federation::auth::{Actor, Capability, JwtManager, Principal};
use olg_federation::health::HealthReport;
use olg_federation::registry::RegisterRequest;
use olg_federation::storage::queries_audit::{self, AuditFilter};
use olg_federation::storage::queries_sync;
use olg_federation::storage::{
    FederationDatabase, Instance, MessageStatus, MessageType, TrustLevel,
};
use olg_federation::transport::{Ack, Envelope, ScriptedTransport, Transport, TransportError};
use olg_federation::{Classify, FederationErrorKind, FederationService};

fn admin() -> Actor {
    Actor::User(Principal::new("u1", "alice", [Capability::FederationAdmin]))
}

fn config(domain: &str) -> Config {
    let mut config = Config::default();
    config.instance.domain = domain.to_string();
    config.delivery.base_backoff_secs = 0;
    config.delivery.max_attempts = 3;
    config.delivery.send_timeout_secs = 5;
    config
}

async fn service(config: Config, transport: Arc<dyn Transport>) -> FederationService {
    let db = FederationDatabase::open_in_memory().await.unwrap();
    FederationService::new(
        config,
        db,
        SigningIdentity::generate(),
        transport,
        JwtManager::new(b"test-secret", 3600),
    )
}

async fn register(svc: &FederationService, domain: &str, public_key: String) -> Instance {
    svc.registry
        .register(
            &RegisterRequest {
                domain: domain.into(),
                public_key,
                endpoint: format!("https://{domain}"),
                description: String::new(),
            },
            &admin(),
            None,
        )
        .await
        .unwrap()
}

async fn count(svc: &FederationService, action: &str, resource_id: Option<&str>) -> i64 {
    let mut conn = svc.db.pool().acquire().await.unwrap();
    queries_audit::count_action(&mut conn, action, resource_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn always_failing_peer_ends_fully_dead_lettered() {
    let transport = Arc::new(ScriptedTransport::failing(TransportError::Unreachable(
        "connection refused".into(),
    )));
    let svc = service(config("local.example"), transport.clone()).await;
    let peer = register(&svc, "peer.example", SigningIdentity::generate().public_key_base64()).await;

    for n in 0..5 {
        svc.queue
            .enqueue(&peer.id, MessageType::Notification, json!({ "n": n }), &admin())
            .await
            .unwrap();
    }

    for _ in 0..50 {
        svc.delivery.tick().await.unwrap();
        if svc.queue.stats(None).await.unwrap().depth == 0 {
            break;
        }
    }

    let health = HealthReport::collect(&svc.db).await.unwrap();
    assert_eq!(health.queue_depth, 0);
    assert_eq!(health.dead_letter_count, 5);
    assert_eq!(health.oldest_pending_age_secs, None);
    assert_eq!(health.status, "degraded");
    assert_eq!(health.instances[0].dead_letter_count, 5);

    assert_eq!(transport.sent().await.len(), 15);
    assert_eq!(count(&svc, "delivery-failed", None).await, 5);
    assert_eq!(count(&svc, "message-retry-scheduled", None).await, 10);

    let dead = svc
        .queue
        .list(&olg_federation::storage::queries_messages::MessageFilter {
            status: Some(MessageStatus::DeadLettered),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(dead.len(), 5);
    assert!(dead.iter().all(|m| m.attempts == 3));
}

#[tokio::test]
async fn re_registering_a_domain_creates_a_new_instance() {
    let svc = service(
        config("local.example"),
        Arc::new(ScriptedTransport::acknowledging()),
    )
    .await;

    let first = register(&svc, "peer.example", SigningIdentity::generate().public_key_base64()).await;
    svc.registry.deactivate(&first.id, &admin(), None).await.unwrap();
    let second =
        register(&svc, "peer.example", SigningIdentity::generate().public_key_base64()).await;

    assert_ne!(first.id, second.id);
    assert_eq!(svc.registry.lookup("peer.example").await.unwrap().id, second.id);
    assert_eq!(svc.registry.list(false).await.unwrap().len(), 1);
    assert_eq!(svc.registry.list(true).await.unwrap().len(), 2);
    assert!(!svc.registry.get(&first.id).await.unwrap().active);
}

#[tokio::test]
async fn registry_mutations_are_audited_once_in_order() {
    let svc = service(
        config("local.example"),
        Arc::new(ScriptedTransport::acknowledging()),
    )
    .await;
    let peer = register(&svc, "peer.example", SigningIdentity::generate().public_key_base64()).await;
    svc.registry
        .set_trust_level(&peer.id, TrustLevel::Verified, &admin(), Some("203.0.113.7"))
        .await
        .unwrap();
    svc.registry.deactivate(&peer.id, &admin(), None).await.unwrap();

    for action in ["instance-registered", "trust-level-changed", "instance-deactivated"] {
        assert_eq!(count(&svc, action, Some(&peer.id)).await, 1, "{action}");
    }

    let entries = svc
        .audit
        .query(
            &Actor::System,
            &AuditFilter {
                resource_id: Some(peer.id.clone()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(
        actions,
        ["instance-registered", "trust-level-changed", "instance-deactivated"]
    );
    assert!(entries.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert_eq!(entries[1].origin.as_deref(), Some("203.0.113.7"));

    assert!(svc.audit.verify_chain().await.unwrap().is_intact());
}

/// Routes calls to in-process services by peer endpoint.
#[derive(Default)]
struct Loopback {
    services: Mutex<HashMap<String, FederationService>>,
}

impl Loopback {
    async fn attach(&self, endpoint: &str, svc: FederationService) {
        self.services.lock().await.insert(endpoint.to_string(), svc);
    }

    async fn target(&self, peer: &Instance) -> Result<FederationService, TransportError> {
        self.services
            .lock()
            .await
            .get(&peer.endpoint)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(peer.endpoint.clone()))
    }
}

fn to_transport(kind: FederationErrorKind, message: String) -> TransportError {
    match kind {
        FederationErrorKind::AuthFailure => TransportError::Unauthenticated(message),
        FederationErrorKind::Transient | FederationErrorKind::StorageFailure => {
            TransportError::Unreachable(message)
        }
        _ => TransportError::Protocol(message),
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&self, peer: &Instance, envelope: &Envelope) -> Result<Ack, TransportError> {
        let svc = self.target(peer).await?;
        svc.queue
            .receive(envelope, None)
            .await
            .map_err(|e| to_transport(e.kind(), e.to_string()))
    }

    async fn fetch_changes(
        &self,
        peer: &Instance,
        request: &Envelope,
    ) -> Result<Envelope, TransportError> {
        let svc = self.target(peer).await?;
        svc.feed
            .serve(request)
            .await
            .map_err(|e| to_transport(e.kind(), e.to_string()))
    }
}

#[tokio::test]
async fn published_change_reaches_peer_through_notification_and_reconcile() {
    let network = Arc::new(Loopback::default());
    let a = service(config("a.example"), network.clone()).await;
    let b = service(config("b.example"), network.clone()).await;
    network.attach("https://a.example", a.clone()).await;
    network.attach("https://b.example", b.clone()).await;

    let b_at_a = register(&a, "b.example", b.queue.identity().public_key_base64()).await;
    let a_at_b = register(&b, "a.example", a.queue.identity().public_key_base64()).await;

    a.feed
        .publish(
            "course",
            "c1",
            json!({ "title": "Algebra", "ban_status": "banned" })
                .as_object()
                .cloned()
                .unwrap(),
            &admin(),
            None,
        )
        .await
        .unwrap();

    let report = a.delivery.drain_peer(&b_at_a.id).await.unwrap();
    assert_eq!(report.acknowledged, 1);

    // The notification triggers a reconcile on B; an explicit run after it
    // must converge to the same state.
    let outcome = b.sync.reconcile(&a_at_b.id, "course").await.unwrap();
    assert_eq!(outcome.cursor_after, 1);

    let record = {
        let mut conn = b.db.pool().acquire().await.unwrap();
        queries_sync::get_record(&mut conn, "course", "c1")
            .await
            .unwrap()
            .unwrap()
    };
    let fields: serde_json::Value = serde_json::from_str(&record.fields).unwrap();
    assert_eq!(fields["title"], "Algebra");
    // A is unverified at B, so the moderation field is refused.
    assert!(fields.get("ban_status").is_none());

    assert_eq!(count(&b, "message-received", None).await, 1);
    assert!(count(&b, "sync-rejected", None).await >= 1);
    assert!(b.audit.verify_chain().await.unwrap().is_intact());

    let health = HealthReport::collect(&b.db).await.unwrap();
    assert!(health.instances[0].last_reconciled_at.is_some());
}
