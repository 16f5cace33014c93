//! Data models for federation storage.

use serde::{Deserialize, Serialize};

/// Graded authorization tier of a peer. Ordered from least to most trusted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TrustLevel {
    Unverified,
    Verified,
    Trusted,
}

impl TrustLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Trusted => "trusted",
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    DeadLettered,
}

impl MessageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
            Self::DeadLettered => "dead-lettered",
        }
    }

    /// Whether the message still awaits delivery.
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Sent | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Kind of federation message carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageType {
    SyncRequest,
    SyncResponse,
    /// Tells a peer that new changes of a resource type can be fetched.
    SyncAvailable,
    Query,
    Notification,
    Error,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyncRequest => "sync_request",
            Self::SyncResponse => "sync_response",
            Self::SyncAvailable => "sync_available",
            Self::Query => "query",
            Self::Notification => "notification",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum CursorStatus {
    Active,
    /// Halted after a protocol mismatch until an operator resumes it.
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum SessionStatus {
    Completed,
    Failed,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ActorKind {
    System,
    User,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub id: String,
    pub domain: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Base URL of the peer's federation API.
    pub endpoint: String,
    pub description: String,
    pub trust_level: TrustLevel,
    pub active: bool,
    pub flagged_for_review: bool,
    pub last_contacted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deactivated_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederationMessage {
    /// Local insertion order; defines FIFO per peer.
    pub seq: i64,
    pub message_id: String,
    pub direction: Direction,
    pub instance_id: String,
    pub message_type: MessageType,
    /// JSON payload.
    pub payload: String,
    pub signature: String,
    pub status: MessageStatus,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub ack_payload: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub sent_at: Option<i64>,
    pub acknowledged_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncCursor {
    pub instance_id: String,
    pub resource_type: String,
    /// Last applied remote sequence number.
    pub position: i64,
    pub status: CursorStatus,
    pub last_error: Option<String>,
    pub last_synced_at: Option<i64>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncSession {
    pub id: String,
    pub instance_id: String,
    pub resource_type: String,
    pub status: SessionStatus,
    pub cursor_before: i64,
    pub cursor_after: i64,
    pub changes_applied: i64,
    pub fields_rejected: i64,
    pub error: Option<String>,
    pub started_at: i64,
    pub completed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteRecord {
    pub resource_type: String,
    pub resource_id: String,
    /// JSON object of current field values.
    pub fields: String,
    /// JSON object mapping field name to its winning version.
    pub field_versions: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalChange {
    pub sequence: i64,
    pub resource_type: String,
    pub resource_id: String,
    pub fields: String,
    pub changed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub seq: i64,
    pub id: String,
    pub actor_kind: ActorKind,
    pub actor_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub before_value: Option<String>,
    pub after_value: Option<String>,
    pub origin: Option<String>,
    pub result: AuditResult,
    pub reason: Option<String>,
    /// Id of the entry this one corrects.
    pub corrects: Option<String>,
    pub created_at: i64,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// Parsed `after` snapshot.
    pub fn after(&self) -> Option<serde_json::Value> {
        self.after_value
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// Parsed `before` snapshot.
    pub fn before(&self) -> Option<serde_json::Value> {
        self.before_value
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}
