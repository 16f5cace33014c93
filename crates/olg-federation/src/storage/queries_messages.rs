//! Federation message queue queries.
//!
//! Status transitions are conditional on the current status so a transition
//! that lost a race affects zero rows instead of clobbering newer state.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::db::DatabaseError;
use super::models::{Direction, FederationMessage, MessageStatus, MessageType};

/// Parameters for inserting a message row.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub message_id: &'a str,
    pub direction: Direction,
    pub instance_id: &'a str,
    pub message_type: MessageType,
    pub payload: &'a str,
    pub signature: &'a str,
    pub status: MessageStatus,
    pub ack_payload: Option<&'a str>,
    pub now: i64,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    params: &NewMessage<'_>,
) -> Result<FederationMessage, DatabaseError> {
    let acknowledged_at = (params.status == MessageStatus::Acknowledged).then_some(params.now);

    let result = sqlx::query(
        "INSERT INTO federation_messages (message_id, direction, instance_id, message_type, payload, signature, status, next_attempt_at, ack_payload, created_at, updated_at, acknowledged_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(params.message_id)
    .bind(params.direction)
    .bind(params.instance_id)
    .bind(params.message_type)
    .bind(params.payload)
    .bind(params.signature)
    .bind(params.status)
    .bind(params.now)
    .bind(params.ack_payload)
    .bind(params.now)
    .bind(params.now)
    .bind(acknowledged_at)
    .execute(&mut *conn)
    .await?;

    get(conn, result.last_insert_rowid()).await
}

/// Get a message by its local sequence number.
pub async fn get(conn: &mut SqliteConnection, seq: i64) -> Result<FederationMessage, DatabaseError> {
    sqlx::query_as::<_, FederationMessage>("SELECT * FROM federation_messages WHERE seq = ?")
        .bind(seq)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Message #{seq}")))
}

/// Find a message by its sender-assigned id within a peer and direction.
pub async fn find(
    conn: &mut SqliteConnection,
    direction: Direction,
    instance_id: &str,
    message_id: &str,
) -> Result<Option<FederationMessage>, DatabaseError> {
    let message = sqlx::query_as::<_, FederationMessage>(
        "SELECT * FROM federation_messages WHERE direction = ? AND instance_id = ? AND message_id = ?",
    )
    .bind(direction)
    .bind(instance_id)
    .bind(message_id)
    .fetch_optional(conn)
    .await?;
    Ok(message)
}

/// Oldest outbound message for a peer that has not reached a terminal status.
pub async fn head_of_line(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<Option<FederationMessage>, DatabaseError> {
    let message = sqlx::query_as::<_, FederationMessage>(
        "SELECT * FROM federation_messages WHERE instance_id = ? AND direction = 'outbound' AND status IN ('pending', 'sent', 'failed') ORDER BY seq LIMIT 1",
    )
    .bind(instance_id)
    .fetch_optional(conn)
    .await?;
    Ok(message)
}

/// All open outbound messages for a peer, in FIFO order.
pub async fn open_outbound(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<Vec<FederationMessage>, DatabaseError> {
    let messages = sqlx::query_as::<_, FederationMessage>(
        "SELECT * FROM federation_messages WHERE instance_id = ? AND direction = 'outbound' AND status IN ('pending', 'sent', 'failed') ORDER BY seq",
    )
    .bind(instance_id)
    .fetch_all(conn)
    .await?;
    Ok(messages)
}

/// Active peers that have at least one open outbound message.
pub async fn peers_with_open_outbound(
    conn: &mut SqliteConnection,
) -> Result<Vec<String>, DatabaseError> {
    let ids: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT m.instance_id FROM federation_messages m JOIN instances i ON i.id = m.instance_id WHERE m.direction = 'outbound' AND m.status IN ('pending', 'sent', 'failed') AND i.active = 1 ORDER BY m.instance_id",
    )
    .fetch_all(conn)
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// Outbound messages left `sent` by an interrupted attempt.
pub async fn in_flight(
    conn: &mut SqliteConnection,
) -> Result<Vec<FederationMessage>, DatabaseError> {
    let messages = sqlx::query_as::<_, FederationMessage>(
        "SELECT * FROM federation_messages WHERE direction = 'outbound' AND status = 'sent' ORDER BY seq",
    )
    .fetch_all(conn)
    .await?;
    Ok(messages)
}

/// `pending`/`failed` → `sent`, counting the attempt.
pub async fn mark_sent(
    conn: &mut SqliteConnection,
    seq: i64,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE federation_messages SET status = 'sent', attempts = attempts + 1, sent_at = ?, updated_at = ? WHERE seq = ? AND status IN ('pending', 'failed')",
    )
    .bind(now)
    .bind(now)
    .bind(seq)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// `sent` → `acknowledged`.
pub async fn mark_acknowledged(
    conn: &mut SqliteConnection,
    seq: i64,
    ack_payload: &str,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE federation_messages SET status = 'acknowledged', ack_payload = ?, last_error = NULL, acknowledged_at = ?, updated_at = ? WHERE seq = ? AND status = 'sent'",
    )
    .bind(ack_payload)
    .bind(now)
    .bind(now)
    .bind(seq)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// `sent` → `failed`, scheduling the next attempt.
pub async fn mark_failed(
    conn: &mut SqliteConnection,
    seq: i64,
    error: &str,
    next_attempt_at: i64,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE federation_messages SET status = 'failed', last_error = ?, next_attempt_at = ?, updated_at = ? WHERE seq = ? AND status = 'sent'",
    )
    .bind(error)
    .bind(next_attempt_at)
    .bind(now)
    .bind(seq)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Any open status → `dead-lettered`.
pub async fn mark_dead_lettered(
    conn: &mut SqliteConnection,
    seq: i64,
    error: &str,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE federation_messages SET status = 'dead-lettered', last_error = ?, updated_at = ? WHERE seq = ? AND status IN ('pending', 'sent', 'failed')",
    )
    .bind(error)
    .bind(now)
    .bind(seq)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// `dead-lettered` → `pending` with a fresh attempt budget.
pub async fn requeue(
    conn: &mut SqliteConnection,
    seq: i64,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE federation_messages SET status = 'pending', attempts = 0, next_attempt_at = ?, last_error = NULL, updated_at = ? WHERE seq = ? AND status = 'dead-lettered'",
    )
    .bind(now)
    .bind(now)
    .bind(seq)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Filters for listing messages.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub instance_id: Option<String>,
    pub direction: Option<Direction>,
    pub status: Option<MessageStatus>,
    pub limit: Option<i64>,
}

pub async fn list(
    conn: &mut SqliteConnection,
    filter: &MessageFilter,
) -> Result<Vec<FederationMessage>, DatabaseError> {
    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("SELECT * FROM federation_messages WHERE 1 = 1");
    if let Some(instance_id) = &filter.instance_id {
        qb.push(" AND instance_id = ").push_bind(instance_id.clone());
    }
    if let Some(direction) = filter.direction {
        qb.push(" AND direction = ").push_bind(direction);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status);
    }
    qb.push(" ORDER BY seq LIMIT ")
        .push_bind(filter.limit.unwrap_or(100));

    let messages = qb
        .build_query_as::<FederationMessage>()
        .fetch_all(conn)
        .await?;
    Ok(messages)
}

/// Outbound queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueStats {
    /// Messages in `pending`, `sent` or `failed`.
    pub depth: i64,
    pub oldest_open_created_at: Option<i64>,
    pub dead_lettered: i64,
}

/// Outbound queue counters, optionally for a single peer.
pub async fn queue_stats(
    conn: &mut SqliteConnection,
    instance_id: Option<&str>,
) -> Result<QueueStats, DatabaseError> {
    let stats = sqlx::query_as::<_, QueueStats>(
        "SELECT \
            COALESCE(SUM(CASE WHEN status IN ('pending', 'sent', 'failed') THEN 1 ELSE 0 END), 0) AS depth, \
            MIN(CASE WHEN status IN ('pending', 'sent', 'failed') THEN created_at END) AS oldest_open_created_at, \
            COALESCE(SUM(CASE WHEN status = 'dead-lettered' THEN 1 ELSE 0 END), 0) AS dead_lettered \
         FROM federation_messages \
         WHERE direction = 'outbound' AND (? IS NULL OR instance_id = ?)",
    )
    .bind(instance_id)
    .bind(instance_id)
    .fetch_one(conn)
    .await?;
    Ok(stats)
}
