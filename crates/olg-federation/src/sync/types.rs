//! Wire types of the change exchange.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version of the change batch format this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Payload of a `sync_request` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub resource_type: String,
    /// Return changes with a sequence strictly greater than this.
    pub after: i64,
    pub limit: u32,
}

/// Payload of a `sync_response` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub protocol_version: u32,
    pub resource_type: String,
    pub changes: Vec<Change>,
    /// More changes are available after the last one in this batch.
    #[serde(default)]
    pub has_more: bool,
}

/// One change in a peer's feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Position in the peer's feed; strictly increasing within a resource type.
    pub sequence: i64,
    pub resource_id: String,
    pub fields: Map<String, Value>,
    /// Peer-asserted time of the change, Unix seconds.
    pub timestamp: i64,
}

/// Payload of a `sync_available` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAvailable {
    pub resource_type: String,
    pub sequence: i64,
}
