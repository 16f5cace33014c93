//! Last-writer-wins resolution per field.

use serde::{Deserialize, Serialize};

use crate::storage::TrustLevel;

/// Who last wrote a replicated field, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldVersion {
    /// Peer-asserted change time.
    pub timestamp: i64,
    pub trust: TrustLevel,
    /// Domain of the peer the value came from.
    pub origin: String,
}

impl FieldVersion {
    fn rank(&self) -> (i64, TrustLevel, &str) {
        (self.timestamp, self.trust, &self.origin)
    }
}

/// Whether `incoming` replaces `existing`.
///
/// Later timestamp wins. On equal timestamps the higher-trust peer wins, and
/// between equally trusted peers the lexicographically greater domain. An
/// identical version never wins, so re-applying a change is a no-op.
pub fn resolve(existing: Option<&FieldVersion>, incoming: &FieldVersion) -> bool {
    existing.is_none_or(|current| incoming.rank() > current.rank())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(timestamp: i64, trust: TrustLevel, origin: &str) -> FieldVersion {
        FieldVersion {
            timestamp,
            trust,
            origin: origin.into(),
        }
    }

    #[test]
    fn first_write_always_wins() {
        assert!(resolve(None, &version(1, TrustLevel::Unverified, "a.example")));
    }

    #[test]
    fn later_timestamp_wins_regardless_of_trust() {
        let current = version(10, TrustLevel::Trusted, "a.example");
        assert!(resolve(Some(&current), &version(11, TrustLevel::Unverified, "b.example")));
        assert!(!resolve(Some(&current), &version(9, TrustLevel::Trusted, "z.example")));
    }

    #[test]
    fn equal_timestamps_prefer_higher_trust() {
        let current = version(10, TrustLevel::Verified, "z.example");
        assert!(resolve(Some(&current), &version(10, TrustLevel::Trusted, "a.example")));
        assert!(!resolve(Some(&current), &version(10, TrustLevel::Unverified, "zz.example")));
    }

    #[test]
    fn equal_trust_falls_back_to_domain_order() {
        let current = version(10, TrustLevel::Trusted, "b.example");
        assert!(resolve(Some(&current), &version(10, TrustLevel::Trusted, "c.example")));
        assert!(!resolve(Some(&current), &version(10, TrustLevel::Trusted, "a.example")));
    }

    #[test]
    fn identical_version_is_not_reapplied() {
        let current = version(10, TrustLevel::Trusted, "b.example");
        assert!(!resolve(Some(&current), &current.clone()));
    }
}
