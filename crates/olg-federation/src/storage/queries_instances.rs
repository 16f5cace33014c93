//! Instance registry queries.

use sqlx::SqliteConnection;

use super::db::DatabaseError;
use super::models::{Instance, TrustLevel};

/// Parameters for inserting a new instance row.
#[derive(Debug, Clone)]
pub struct NewInstance<'a> {
    pub id: &'a str,
    pub domain: &'a str,
    pub public_key: &'a str,
    pub endpoint: &'a str,
    pub description: &'a str,
    pub trust_level: TrustLevel,
    pub now: i64,
}

/// Insert an instance. Fails with `Conflict` if the domain is already active.
pub async fn insert(
    conn: &mut SqliteConnection,
    params: &NewInstance<'_>,
) -> Result<Instance, DatabaseError> {
    sqlx::query(
        "INSERT INTO instances (id, domain, public_key, endpoint, description, trust_level, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(params.id)
    .bind(params.domain)
    .bind(params.public_key)
    .bind(params.endpoint)
    .bind(params.description)
    .bind(params.trust_level)
    .bind(params.now)
    .bind(params.now)
    .execute(&mut *conn)
    .await?;

    get(conn, params.id).await
}

/// Get an instance by id, active or not.
pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Instance, DatabaseError> {
    sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Instance {id}")))
}

/// Get the active instance registered for a domain.
pub async fn find_active_by_domain(
    conn: &mut SqliteConnection,
    domain: &str,
) -> Result<Option<Instance>, DatabaseError> {
    let instance =
        sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE domain = ? AND active = 1")
            .bind(domain)
            .fetch_optional(conn)
            .await?;
    Ok(instance)
}

/// List instances, newest first.
pub async fn list(
    conn: &mut SqliteConnection,
    include_inactive: bool,
) -> Result<Vec<Instance>, DatabaseError> {
    let sql = if include_inactive {
        "SELECT * FROM instances ORDER BY created_at DESC, domain"
    } else {
        "SELECT * FROM instances WHERE active = 1 ORDER BY created_at DESC, domain"
    };
    let instances = sqlx::query_as::<_, Instance>(sql).fetch_all(conn).await?;
    Ok(instances)
}

pub async fn update_trust_level(
    conn: &mut SqliteConnection,
    id: &str,
    level: TrustLevel,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE instances SET trust_level = ?, updated_at = ? WHERE id = ? AND active = 1",
    )
    .bind(level)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Soft-delete an active instance.
pub async fn deactivate(
    conn: &mut SqliteConnection,
    id: &str,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE instances SET active = 0, deactivated_at = ?, updated_at = ? WHERE id = ? AND active = 1",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Set or clear the review flag. Returns `false` if it already had that value.
pub async fn set_review_flag(
    conn: &mut SqliteConnection,
    id: &str,
    flagged: bool,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE instances SET flagged_for_review = ?, updated_at = ? WHERE id = ? AND flagged_for_review != ?",
    )
    .bind(flagged)
    .bind(now)
    .bind(id)
    .bind(flagged)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_last_contacted(
    conn: &mut SqliteConnection,
    id: &str,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE instances SET last_contacted_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}
