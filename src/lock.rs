use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::error::PersistenceError;

/// Atomically acquires the named job lease for `holder`.
/// Returns true if the lease was acquired, false if another holder has an
/// unexpired lease. Leases older than `lease` are considered abandoned.
pub(crate) async fn try_acquire_job_lease(
    pool: &SqlitePool,
    name: &str,
    holder: &str,
    lease: Duration,
) -> Result<bool, PersistenceError> {
    let now = Utc::now();
    let mut sql_tx = pool.begin().await?;

    sqlx::query("DELETE FROM job_leases WHERE name = ?1 AND acquired_at < ?2")
        .bind(name)
        .bind(now - lease)
        .execute(sql_tx.as_mut())
        .await?;

    let result = sqlx::query(
        "INSERT OR IGNORE INTO job_leases (name, holder, acquired_at) VALUES (?1, ?2, ?3)",
    )
    .bind(name)
    .bind(holder)
    .bind(now)
    .execute(sql_tx.as_mut())
    .await?;

    sql_tx.commit().await?;

    Ok(result.rows_affected() > 0)
}

/// Releases the lease if `holder` still owns it.
pub(crate) async fn release_job_lease(
    pool: &SqlitePool,
    name: &str,
    holder: &str,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query("DELETE FROM job_leases WHERE name = ?1 AND holder = ?2")
        .bind(name)
        .bind(holder)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
