//! Hash chain over the audit log.
//!
//! `entry_hash = SHA-256(prev_hash || "\n" || canonical JSON of the entry)`.
//! The first entry links to [`GENESIS_HASH`].

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::storage::{ActorKind, AuditEntry, AuditResult};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Field order here is the canonical order and must never change.
#[derive(Serialize)]
struct Canonical<'a> {
    id: &'a str,
    actor_kind: ActorKind,
    actor_id: Option<&'a str>,
    action: &'a str,
    resource_type: &'a str,
    resource_id: &'a str,
    before: Option<&'a str>,
    after: Option<&'a str>,
    origin: Option<&'a str>,
    result: AuditResult,
    reason: Option<&'a str>,
    corrects: Option<&'a str>,
    created_at: i64,
}

/// Hash an entry's content linked to `prev_hash`. Ignores `seq` and the stored hashes.
pub fn compute_hash(prev_hash: &str, entry: &AuditEntry) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(&Canonical {
        id: &entry.id,
        actor_kind: entry.actor_kind,
        actor_id: entry.actor_id.as_deref(),
        action: &entry.action,
        resource_type: &entry.resource_type,
        resource_id: &entry.resource_id,
        before: entry.before_value.as_deref(),
        after: entry.after_value.as_deref(),
        origin: entry.origin.as_deref(),
        result: entry.result,
        reason: entry.reason.as_deref(),
        corrects: entry.corrects.as_deref(),
        created_at: entry.created_at,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Where and why the chain stopped verifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenLink {
    pub seq: i64,
    pub id: String,
    pub reason: String,
}

/// Result of walking the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub entries: usize,
    pub head: String,
    pub first_broken: Option<BrokenLink>,
}

impl ChainReport {
    pub const fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }
}

/// Verify entries given in append order.
pub fn verify(entries: &[AuditEntry]) -> Result<ChainReport, serde_json::Error> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for entry in entries {
        if entry.prev_hash != expected_prev {
            return Ok(broken(entries.len(), expected_prev, entry, "prev_hash does not match"));
        }
        let recomputed = compute_hash(&entry.prev_hash, entry)?;
        if recomputed != entry.entry_hash {
            return Ok(broken(entries.len(), expected_prev, entry, "entry_hash does not match content"));
        }
        expected_prev.clone_from(&entry.entry_hash);
    }
    Ok(ChainReport {
        entries: entries.len(),
        head: expected_prev,
        first_broken: None,
    })
}

fn broken(entries: usize, head: String, entry: &AuditEntry, reason: &str) -> ChainReport {
    ChainReport {
        entries,
        head,
        first_broken: Some(BrokenLink {
            seq: entry.seq,
            id: entry.id.clone(),
            reason: reason.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(seq: i64, id: &str) -> AuditEntry {
        AuditEntry {
            seq,
            id: id.to_string(),
            actor_kind: ActorKind::System,
            actor_id: None,
            action: "instance-registered".to_string(),
            resource_type: "instance".to_string(),
            resource_id: "i1".to_string(),
            before_value: None,
            after_value: Some(r#"{"trust_level":"unverified"}"#.to_string()),
            origin: None,
            result: AuditResult::Success,
            reason: None,
            corrects: None,
            created_at: 1_700_000_000,
            prev_hash: String::new(),
            entry_hash: String::new(),
        }
    }

    fn chain(n: i64) -> Vec<AuditEntry> {
        let mut prev = GENESIS_HASH.to_string();
        (1..=n)
            .map(|seq| {
                let mut e = entry(seq, &format!("a{seq}"));
                e.prev_hash.clone_from(&prev);
                e.entry_hash = compute_hash(&prev, &e).unwrap();
                prev.clone_from(&e.entry_hash);
                e
            })
            .collect()
    }

    #[test]
    fn hash_is_deterministic_and_hex() {
        let e = entry(1, "a1");
        let h1 = compute_hash(GENESIS_HASH, &e).unwrap();
        let h2 = compute_hash(GENESIS_HASH, &e).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, compute_hash(&h1, &e).unwrap());
    }

    #[test]
    fn intact_chain_verifies() {
        let entries = chain(4);
        let report = verify(&entries).unwrap();
        assert!(report.is_intact());
        assert_eq!(report.entries, 4);
        assert_eq!(report.head, entries[3].entry_hash);
    }

    #[test]
    fn empty_chain_is_intact() {
        let report = verify(&[]).unwrap();
        assert!(report.is_intact());
        assert_eq!(report.head, GENESIS_HASH);
    }

    #[test]
    fn edited_content_is_detected() {
        let mut entries = chain(3);
        entries[1].after_value = Some(r#"{"trust_level":"trusted"}"#.to_string());
        let broken = verify(&entries).unwrap().first_broken.unwrap();
        assert_eq!(broken.seq, 2);
        assert!(broken.reason.contains("content"));
    }

    #[test]
    fn removed_entry_is_detected() {
        let mut entries = chain(3);
        entries.remove(1);
        let broken = verify(&entries).unwrap().first_broken.unwrap();
        assert_eq!(broken.id, "a3");
        assert!(broken.reason.contains("prev_hash"));
    }
}
