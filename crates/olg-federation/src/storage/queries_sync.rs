//! Sync cursor, session, replicated record and local change feed queries.

use sqlx::SqliteConnection;

use super::db::DatabaseError;
use super::models::{CursorStatus, LocalChange, RemoteRecord, SyncCursor, SyncSession};

// =========================================================================
// Cursors
// =========================================================================

pub async fn get_cursor(
    conn: &mut SqliteConnection,
    instance_id: &str,
    resource_type: &str,
) -> Result<Option<SyncCursor>, DatabaseError> {
    let cursor = sqlx::query_as::<_, SyncCursor>(
        "SELECT * FROM sync_cursors WHERE instance_id = ? AND resource_type = ?",
    )
    .bind(instance_id)
    .bind(resource_type)
    .fetch_optional(conn)
    .await?;
    Ok(cursor)
}

pub async fn list_cursors(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<Vec<SyncCursor>, DatabaseError> {
    let cursors = sqlx::query_as::<_, SyncCursor>(
        "SELECT * FROM sync_cursors WHERE instance_id = ? ORDER BY resource_type",
    )
    .bind(instance_id)
    .fetch_all(conn)
    .await?;
    Ok(cursors)
}

/// Move the cursor to `position` after a batch was applied.
pub async fn advance_cursor(
    conn: &mut SqliteConnection,
    instance_id: &str,
    resource_type: &str,
    position: i64,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO sync_cursors (instance_id, resource_type, position, status, last_synced_at, updated_at) \
         VALUES (?, ?, ?, 'active', ?, ?) \
         ON CONFLICT (instance_id, resource_type) DO UPDATE SET \
            position = excluded.position, last_error = NULL, \
            last_synced_at = excluded.last_synced_at, updated_at = excluded.updated_at",
    )
    .bind(instance_id)
    .bind(resource_type)
    .bind(position)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Set the cursor status without moving its position.
pub async fn set_cursor_status(
    conn: &mut SqliteConnection,
    instance_id: &str,
    resource_type: &str,
    status: CursorStatus,
    last_error: Option<&str>,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO sync_cursors (instance_id, resource_type, position, status, last_error, updated_at) \
         VALUES (?, ?, 0, ?, ?, ?) \
         ON CONFLICT (instance_id, resource_type) DO UPDATE SET \
            status = excluded.status, last_error = excluded.last_error, updated_at = excluded.updated_at",
    )
    .bind(instance_id)
    .bind(resource_type)
    .bind(status)
    .bind(last_error)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

// =========================================================================
// Sessions
// =========================================================================

pub async fn insert_session(
    conn: &mut SqliteConnection,
    session: &SyncSession,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO sync_sessions (id, instance_id, resource_type, status, cursor_before, cursor_after, changes_applied, fields_rejected, error, started_at, completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&session.id)
    .bind(&session.instance_id)
    .bind(&session.resource_type)
    .bind(session.status)
    .bind(session.cursor_before)
    .bind(session.cursor_after)
    .bind(session.changes_applied)
    .bind(session.fields_rejected)
    .bind(session.error.as_deref())
    .bind(session.started_at)
    .bind(session.completed_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Most recent sessions for a peer, newest first.
pub async fn list_sessions(
    conn: &mut SqliteConnection,
    instance_id: &str,
    limit: i64,
) -> Result<Vec<SyncSession>, DatabaseError> {
    let sessions = sqlx::query_as::<_, SyncSession>(
        "SELECT * FROM sync_sessions WHERE instance_id = ? ORDER BY completed_at DESC, started_at DESC LIMIT ?",
    )
    .bind(instance_id)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(sessions)
}

/// Completion time of the latest successful session with a peer.
pub async fn last_completed_at(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<Option<i64>, DatabaseError> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MAX(completed_at) FROM sync_sessions WHERE instance_id = ? AND status = 'completed'",
    )
    .bind(instance_id)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

// =========================================================================
// Replicated records
// =========================================================================

pub async fn get_record(
    conn: &mut SqliteConnection,
    resource_type: &str,
    resource_id: &str,
) -> Result<Option<RemoteRecord>, DatabaseError> {
    let record = sqlx::query_as::<_, RemoteRecord>(
        "SELECT * FROM remote_records WHERE resource_type = ? AND resource_id = ?",
    )
    .bind(resource_type)
    .bind(resource_id)
    .fetch_optional(conn)
    .await?;
    Ok(record)
}

pub async fn upsert_record(
    conn: &mut SqliteConnection,
    record: &RemoteRecord,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO remote_records (resource_type, resource_id, fields, field_versions, updated_at) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (resource_type, resource_id) DO UPDATE SET \
            fields = excluded.fields, field_versions = excluded.field_versions, updated_at = excluded.updated_at",
    )
    .bind(&record.resource_type)
    .bind(&record.resource_id)
    .bind(&record.fields)
    .bind(&record.field_versions)
    .bind(record.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// All replicated records of a type, ordered by id.
pub async fn list_records(
    conn: &mut SqliteConnection,
    resource_type: &str,
) -> Result<Vec<RemoteRecord>, DatabaseError> {
    let records = sqlx::query_as::<_, RemoteRecord>(
        "SELECT * FROM remote_records WHERE resource_type = ? ORDER BY resource_id",
    )
    .bind(resource_type)
    .fetch_all(conn)
    .await?;
    Ok(records)
}

// =========================================================================
// Local change feed
// =========================================================================

pub async fn insert_local_change(
    conn: &mut SqliteConnection,
    resource_type: &str,
    resource_id: &str,
    fields: &str,
    now: i64,
) -> Result<LocalChange, DatabaseError> {
    let result = sqlx::query(
        "INSERT INTO local_changes (resource_type, resource_id, fields, changed_at) VALUES (?, ?, ?, ?)",
    )
    .bind(resource_type)
    .bind(resource_id)
    .bind(fields)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let sequence = result.last_insert_rowid();
    sqlx::query_as::<_, LocalChange>("SELECT * FROM local_changes WHERE sequence = ?")
        .bind(sequence)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Local change #{sequence}")))
}

/// Local changes of a type strictly after `after`, oldest first.
pub async fn local_changes_since(
    conn: &mut SqliteConnection,
    resource_type: &str,
    after: i64,
    limit: i64,
) -> Result<Vec<LocalChange>, DatabaseError> {
    let changes = sqlx::query_as::<_, LocalChange>(
        "SELECT * FROM local_changes WHERE resource_type = ? AND sequence > ? ORDER BY sequence LIMIT ?",
    )
    .bind(resource_type)
    .bind(after)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(changes)
}
