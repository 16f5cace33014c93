//! Trust-gated field acceptance.

use crate::storage::TrustLevel;

/// Fields that only `trusted` peers may change.
pub const TRUST_SENSITIVE_FIELDS: &[&str] =
    &["ban_status", "appeal_status", "report_status", "trust_level"];

pub fn is_trust_sensitive(field: &str) -> bool {
    TRUST_SENSITIVE_FIELDS.contains(&field)
}

/// Whether a field update from a peer at `peer_trust` may be applied.
///
/// Trust-sensitive fields need a `trusted` peer; everything else is accepted
/// from any registered peer.
pub fn accept(field: &str, peer_trust: TrustLevel) -> bool {
    !is_trust_sensitive(field) || peer_trust == TrustLevel::Trusted
}
