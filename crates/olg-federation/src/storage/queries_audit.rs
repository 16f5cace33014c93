//! Audit log queries. The table only ever sees INSERT and SELECT.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::db::DatabaseError;
use super::models::{ActorKind, AuditEntry};

/// Hash of the most recent entry, if any.
pub async fn head_hash(conn: &mut SqliteConnection) -> Result<Option<String>, DatabaseError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT entry_hash FROM audit_log ORDER BY seq DESC LIMIT 1")
            .fetch_optional(conn)
            .await?;
    Ok(row.map(|(hash,)| hash))
}

/// Append an entry. `entry.seq` is ignored; the assigned one is returned.
pub async fn insert(conn: &mut SqliteConnection, entry: &AuditEntry) -> Result<i64, DatabaseError> {
    let result = sqlx::query(
        "INSERT INTO audit_log (id, actor_kind, actor_id, action, resource_type, resource_id, before_value, after_value, origin, result, reason, corrects, created_at, prev_hash, entry_hash) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(entry.actor_kind)
    .bind(entry.actor_id.as_deref())
    .bind(&entry.action)
    .bind(&entry.resource_type)
    .bind(&entry.resource_id)
    .bind(entry.before_value.as_deref())
    .bind(entry.after_value.as_deref())
    .bind(entry.origin.as_deref())
    .bind(entry.result)
    .bind(entry.reason.as_deref())
    .bind(entry.corrects.as_deref())
    .bind(entry.created_at)
    .bind(&entry.prev_hash)
    .bind(&entry.entry_hash)
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<AuditEntry, DatabaseError> {
    sqlx::query_as::<_, AuditEntry>("SELECT * FROM audit_log WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Audit entry {id}")))
}

/// Every entry in append order.
pub async fn all_in_order(conn: &mut SqliteConnection) -> Result<Vec<AuditEntry>, DatabaseError> {
    let entries = sqlx::query_as::<_, AuditEntry>("SELECT * FROM audit_log ORDER BY seq")
        .fetch_all(conn)
        .await?;
    Ok(entries)
}

/// Audit log filters. All set filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub actor_kind: Option<ActorKind>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<i64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<i64>,
    pub limit: Option<i64>,
}

impl AuditFilter {
    pub const DEFAULT_LIMIT: i64 = 200;
}

/// Matching entries in append order.
pub async fn query(
    conn: &mut SqliteConnection,
    filter: &AuditFilter,
) -> Result<Vec<AuditEntry>, DatabaseError> {
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT * FROM audit_log WHERE 1 = 1");
    if let Some(kind) = filter.actor_kind {
        qb.push(" AND actor_kind = ").push_bind(kind);
    }
    if let Some(actor_id) = &filter.actor_id {
        qb.push(" AND actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(action) = &filter.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(resource_type) = &filter.resource_type {
        qb.push(" AND resource_type = ")
            .push_bind(resource_type.clone());
    }
    if let Some(resource_id) = &filter.resource_id {
        qb.push(" AND resource_id = ").push_bind(resource_id.clone());
    }
    if let Some(since) = filter.since {
        qb.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        qb.push(" AND created_at <= ").push_bind(until);
    }
    qb.push(" ORDER BY seq LIMIT ")
        .push_bind(filter.limit.unwrap_or(AuditFilter::DEFAULT_LIMIT));

    let entries = qb.build_query_as::<AuditEntry>().fetch_all(conn).await?;
    Ok(entries)
}

/// Number of entries with the given action, optionally for one resource.
pub async fn count_action(
    conn: &mut SqliteConnection,
    action: &str,
    resource_id: Option<&str>,
) -> Result<i64, DatabaseError> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM audit_log WHERE action = ? AND (? IS NULL OR resource_id = ?)",
    )
    .bind(action)
    .bind(resource_id)
    .bind(resource_id)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}
