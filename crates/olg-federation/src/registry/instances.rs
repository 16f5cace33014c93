//! Registry operations.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use olg_core::db::unix_timestamp;

use super::RegistryError;
use super::validate::{normalize_domain, normalize_endpoint};
use crate::audit::{AuditAction, AuditLog, NewAuditEntry, resource};
use crate::auth::{Actor, Capability};
use crate::locks::{KeyedLocks, instance_key};
use crate::storage::queries_instances::{self as instances, NewInstance};
use crate::storage::queries_messages as messages;
use crate::storage::{AuditResult, DatabaseError, FederationDatabase, Instance, TrustLevel};

/// Audit snapshot of an instance.
pub fn instance_snapshot(instance: &Instance) -> Value {
    json!({
        "domain": instance.domain,
        "trust_level": instance.trust_level,
        "active": instance.active,
        "flagged_for_review": instance.flagged_for_review,
        "endpoint": instance.endpoint,
        "public_key": instance.public_key,
    })
}

/// A locally initiated registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub domain: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
}

/// A registration request sent by the peer itself, signed with the key it
/// asks to register.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRegistration {
    pub domain: String,
    pub public_key: String,
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: i64,
    pub signature: String,
}

impl RemoteRegistration {
    /// Bytes covered by the signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "register:{}:{}:{}:{}",
            self.domain, self.public_key, self.endpoint, self.timestamp
        )
        .into_bytes()
    }

    /// Build and sign a registration for the local identity.
    pub fn signed(
        identity: &olg_crypto::SigningIdentity,
        domain: &str,
        endpoint: &str,
        description: &str,
    ) -> Self {
        let mut registration = Self {
            domain: domain.to_string(),
            public_key: identity.public_key_base64(),
            endpoint: endpoint.to_string(),
            description: description.to_string(),
            timestamp: unix_timestamp(),
            signature: String::new(),
        };
        registration.signature = identity.sign(&registration.canonical_bytes());
        registration
    }
}

/// Set the review flag inside the caller's transaction.
///
/// Returns `false` without auditing if the instance was already flagged.
pub async fn flag_in(
    conn: &mut SqliteConnection,
    instance_id: &str,
    actor: &Actor,
    reason: &str,
    origin: Option<&str>,
) -> Result<bool, RegistryError> {
    let before = instances::get(conn, instance_id).await?;
    if !instances::set_review_flag(conn, instance_id, true, unix_timestamp()).await? {
        return Ok(false);
    }
    let after = instances::get(conn, instance_id).await?;
    AuditLog::record_in(
        conn,
        NewAuditEntry::new(actor, AuditAction::InstanceFlagged, resource::INSTANCE, instance_id)
            .before(instance_snapshot(&before))
            .after(instance_snapshot(&after))
            .origin(origin)
            .reason(reason),
    )
    .await?;
    warn!(instance_id = %instance_id, domain = %after.domain, reason, "Instance flagged for review");
    Ok(true)
}

/// Durable registry of federated peers.
#[derive(Clone)]
pub struct InstanceRegistry {
    db: FederationDatabase,
    locks: KeyedLocks,
}

impl InstanceRegistry {
    pub const fn new(db: FederationDatabase, locks: KeyedLocks) -> Self {
        Self { db, locks }
    }

    /// Register a peer at `unverified`. Requires the admin capability.
    #[instrument(skip(self, request, actor), fields(domain = %request.domain, actor = %actor))]
    pub async fn register(
        &self,
        request: &RegisterRequest,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<Instance, RegistryError> {
        self.authorize(actor, AuditAction::InstanceRegistered, &request.domain, origin)
            .await?;
        self.insert(request, actor, origin).await
    }

    /// Register a peer from its own signed request. Lands at `unverified`.
    #[instrument(skip(self, registration), fields(domain = %registration.domain))]
    pub async fn register_remote(
        &self,
        registration: &RemoteRegistration,
        origin: Option<&str>,
        max_clock_skew_secs: i64,
    ) -> Result<Instance, RegistryError> {
        let skew = (unix_timestamp() - registration.timestamp).abs();
        if skew > max_clock_skew_secs {
            return Err(RegistryError::ClockSkew { skew_secs: skew });
        }
        olg_crypto::verify_signature(
            &registration.public_key,
            &registration.canonical_bytes(),
            &registration.signature,
        )
        .map_err(|e| RegistryError::BadRegistrationSignature(e.to_string()))?;

        let domain = normalize_domain(&registration.domain)?;
        let actor = Actor::Instance(domain.clone());
        let request = RegisterRequest {
            domain,
            public_key: registration.public_key.clone(),
            endpoint: registration.endpoint.clone(),
            description: registration.description.clone(),
        };
        self.insert(&request, &actor, origin).await
    }

    async fn insert(
        &self,
        request: &RegisterRequest,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<Instance, RegistryError> {
        let domain = normalize_domain(&request.domain)?;
        let endpoint = normalize_endpoint(&request.endpoint)?;
        olg_crypto::decode_public_key(&request.public_key)
            .map_err(RegistryError::InvalidPublicKey)?;
        let public_key = request.public_key.trim();

        let mut tx = self.db.begin_write().await?;
        if instances::find_active_by_domain(tx.conn(), &domain).await?.is_some() {
            return Err(RegistryError::DuplicateInstance(domain));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let instance = instances::insert(
            tx.conn(),
            &NewInstance {
                id: &id,
                domain: &domain,
                public_key,
                endpoint: &endpoint,
                description: &request.description,
                trust_level: TrustLevel::Unverified,
                now: unix_timestamp(),
            },
        )
        .await
        .map_err(|e| match e {
            DatabaseError::Conflict(_) => RegistryError::DuplicateInstance(domain.clone()),
            other => other.into(),
        })?;

        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(actor, AuditAction::InstanceRegistered, resource::INSTANCE, &id)
                .after(instance_snapshot(&instance))
                .origin(origin),
        )
        .await?;
        tx.commit().await?;

        info!(instance_id = %instance.id, domain = %instance.domain, "Instance registered");
        Ok(instance)
    }

    /// Change a peer's trust level. Takes effect at the next reconciliation apply.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn set_trust_level(
        &self,
        instance_id: &str,
        level: TrustLevel,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<Instance, RegistryError> {
        self.authorize(actor, AuditAction::TrustLevelChanged, instance_id, origin)
            .await?;

        let _guard = self.locks.lock(&instance_key(instance_id)).await;
        let mut tx = self.db.begin_write().await?;
        let before = active_instance(tx.conn(), instance_id).await?;
        instances::update_trust_level(tx.conn(), instance_id, level, unix_timestamp()).await?;
        let after = instances::get(tx.conn(), instance_id).await?;

        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(actor, AuditAction::TrustLevelChanged, resource::INSTANCE, instance_id)
                .before(instance_snapshot(&before))
                .after(instance_snapshot(&after))
                .origin(origin),
        )
        .await?;
        tx.commit().await?;

        info!(
            instance_id = %instance_id,
            from = %before.trust_level,
            to = %after.trust_level,
            "Trust level changed"
        );
        Ok(after)
    }

    /// Soft-delete a peer and dead-letter its outstanding outbound messages.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn deactivate(
        &self,
        instance_id: &str,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<Instance, RegistryError> {
        self.authorize(actor, AuditAction::InstanceDeactivated, instance_id, origin)
            .await?;

        let _guard = self.locks.lock(&instance_key(instance_id)).await;
        let mut tx = self.db.begin_write().await?;
        let before = instances::get(tx.conn(), instance_id)
            .await
            .map_err(|e| not_found(e, instance_id))?;
        if !before.active {
            return Err(RegistryError::AlreadyInactive(instance_id.to_string()));
        }

        let now = unix_timestamp();
        instances::deactivate(tx.conn(), instance_id, now).await?;
        let after = instances::get(tx.conn(), instance_id).await?;
        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(actor, AuditAction::InstanceDeactivated, resource::INSTANCE, instance_id)
                .before(instance_snapshot(&before))
                .after(instance_snapshot(&after))
                .origin(origin),
        )
        .await?;

        let open = messages::open_outbound(tx.conn(), instance_id).await?;
        let mut dead_lettered = 0usize;
        for message in &open {
            if !messages::mark_dead_lettered(tx.conn(), message.seq, "instance deactivated", now)
                .await?
            {
                continue;
            }
            AuditLog::record_in(
                tx.conn(),
                NewAuditEntry::new(
                    actor,
                    AuditAction::DeliveryFailed,
                    resource::MESSAGE,
                    message.message_id.clone(),
                )
                .before(json!({"status": message.status, "attempts": message.attempts}))
                .after(json!({"status": "dead-lettered", "attempts": message.attempts}))
                .origin(origin)
                .reason("instance deactivated"),
            )
            .await?;
            dead_lettered += 1;
        }
        tx.commit().await?;

        info!(instance_id = %instance_id, domain = %after.domain, dead_lettered, "Instance deactivated");
        Ok(after)
    }

    /// The active instance for a domain.
    pub async fn lookup(&self, domain: &str) -> Result<Instance, RegistryError> {
        let domain = domain.trim().to_ascii_lowercase();
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        instances::find_active_by_domain(&mut conn, &domain)
            .await?
            .ok_or(RegistryError::NotFound(domain))
    }

    /// An instance by id, active or not.
    pub async fn get(&self, instance_id: &str) -> Result<Instance, RegistryError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        instances::get(&mut conn, instance_id)
            .await
            .map_err(|e| not_found(e, instance_id))
    }

    pub async fn list(&self, include_inactive: bool) -> Result<Vec<Instance>, RegistryError> {
        let mut conn = self.db.pool().acquire().await.map_err(DatabaseError::from)?;
        Ok(instances::list(&mut conn, include_inactive).await?)
    }

    /// Flag a peer for operator review. Does not block traffic.
    pub async fn flag_for_review(
        &self,
        instance_id: &str,
        actor: &Actor,
        reason: &str,
        origin: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let _guard = self.locks.lock(&instance_key(instance_id)).await;
        let mut tx = self.db.begin_write().await?;
        let flagged = flag_in(tx.conn(), instance_id, actor, reason, origin)
            .await
            .map_err(|e| match e {
                RegistryError::Storage(db) => not_found(db, instance_id),
                other => other,
            })?;
        tx.commit().await?;
        Ok(flagged)
    }

    /// Clear the review flag. Requires the admin capability.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn clear_review_flag(
        &self,
        instance_id: &str,
        actor: &Actor,
        origin: Option<&str>,
    ) -> Result<Instance, RegistryError> {
        self.authorize(actor, AuditAction::InstanceFlagCleared, instance_id, origin)
            .await?;

        let _guard = self.locks.lock(&instance_key(instance_id)).await;
        let mut tx = self.db.begin_write().await?;
        let before = instances::get(tx.conn(), instance_id)
            .await
            .map_err(|e| not_found(e, instance_id))?;
        if !instances::set_review_flag(tx.conn(), instance_id, false, unix_timestamp()).await? {
            return Ok(before);
        }
        let after = instances::get(tx.conn(), instance_id).await?;
        AuditLog::record_in(
            tx.conn(),
            NewAuditEntry::new(actor, AuditAction::InstanceFlagCleared, resource::INSTANCE, instance_id)
                .before(instance_snapshot(&before))
                .after(instance_snapshot(&after))
                .origin(origin),
        )
        .await?;
        tx.commit().await?;

        info!(instance_id = %instance_id, "Review flag cleared");
        Ok(after)
    }

    /// Require the admin capability, recording a `denied` entry when it is missing.
    async fn authorize(
        &self,
        actor: &Actor,
        action: AuditAction,
        target: &str,
        origin: Option<&str>,
    ) -> Result<(), RegistryError> {
        let Err(denied) = actor.require(Capability::FederationAdmin) else {
            return Ok(());
        };

        AuditLog::new(self.db.clone())
            .record(
                NewAuditEntry::new(actor, action, resource::INSTANCE, target)
                    .result(AuditResult::Denied)
                    .origin(origin)
                    .reason(denied.to_string()),
            )
            .await?;
        warn!(actor = %actor, action = %action, target, "Registry operation denied");
        Err(denied.into())
    }
}

async fn active_instance(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<Instance, RegistryError> {
    let instance = instances::get(conn, instance_id)
        .await
        .map_err(|e| not_found(e, instance_id))?;
    if instance.active {
        Ok(instance)
    } else {
        Err(RegistryError::NotFound(instance_id.to_string()))
    }
}

fn not_found(e: DatabaseError, instance_id: &str) -> RegistryError {
    match e {
        DatabaseError::NotFound(_) => RegistryError::NotFound(instance_id.to_string()),
        other => other.into(),
    }
}
