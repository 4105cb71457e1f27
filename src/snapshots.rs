//! Latest broker statistics per trading account.
//!
//! Each account has at most one snapshot. Syncs overwrite it in place and
//! leave the rank alone; ranks only change when the ranking pass runs.

use chrono::{DateTime, Utc};
use league_broker::UserStats;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::error::{LeagueError, PersistenceError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub account_id: i64,
    pub raw_response: Value,
    pub equity: Option<f64>,
    pub total_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub floating_pnl: Option<f64>,
    pub margin: Option<f64>,
    pub open_positions: Option<i64>,
    pub rank: Option<i64>,
    pub last_ranked_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: i64,
    account_id: i64,
    raw_response: String,
    equity: Option<f64>,
    total_pnl: Option<f64>,
    realized_pnl: Option<f64>,
    floating_pnl: Option<f64>,
    margin: Option<f64>,
    open_positions: Option<i64>,
    rank: Option<i64>,
    last_ranked_at: Option<DateTime<Utc>>,
    synced_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = PersistenceError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            account_id: row.account_id,
            raw_response: serde_json::from_str(&row.raw_response).map_err(|source| {
                PersistenceError::InvalidJson {
                    column: "snapshots.raw_response",
                    source,
                }
            })?,
            equity: row.equity,
            total_pnl: row.total_pnl,
            realized_pnl: row.realized_pnl,
            floating_pnl: row.floating_pnl,
            margin: row.margin,
            open_positions: row.open_positions,
            rank: row.rank,
            last_ranked_at: row.last_ranked_at,
            synced_at: row.synced_at,
        })
    }
}

const SNAPSHOT_COLUMNS: &str = "id, account_id, raw_response, equity, total_pnl, realized_pnl, \
                                floating_pnl, margin, open_positions, rank, last_ranked_at, \
                                synced_at";

/// One row of the public leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based position within this leaderboard.
    pub position: usize,
    pub rank: Option<i64>,
    pub account_id: i64,
    pub login: Option<String>,
    pub league_id: Option<i64>,
    pub user_id: i64,
    pub display_name: String,
    pub image_url: Option<String>,
    pub realized_pnl: Option<f64>,
    pub total_pnl: Option<f64>,
    pub equity: Option<f64>,
    pub synced_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LeaderboardRow {
    rank: Option<i64>,
    account_id: i64,
    login: Option<String>,
    league_id: Option<i64>,
    user_id: i64,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    image_url: Option<String>,
    realized_pnl: Option<f64>,
    total_pnl: Option<f64>,
    equity: Option<f64>,
    synced_at: DateTime<Utc>,
}

impl LeaderboardRow {
    fn into_entry(self, position: usize) -> LeaderboardEntry {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        LeaderboardEntry {
            position,
            rank: self.rank,
            account_id: self.account_id,
            login: self.login,
            league_id: self.league_id,
            user_id: self.user_id,
            display_name: if name.is_empty() { self.email } else { name },
            image_url: self.image_url,
            realized_pnl: self.realized_pnl,
            total_pnl: self.total_pnl,
            equity: self.equity,
            synced_at: self.synced_at,
        }
    }
}

/// Inserts or overwrites the account's snapshot with freshly fetched stats.
pub async fn upsert_snapshot(
    pool: &SqlitePool,
    account_id: i64,
    stats: &UserStats,
) -> Result<Snapshot, PersistenceError> {
    let raw_response =
        serde_json::to_string(&stats.raw).map_err(|source| PersistenceError::InvalidJson {
            column: "snapshots.raw_response",
            source,
        })?;

    sqlx::query(
        r#"
        INSERT INTO snapshots (
            account_id, raw_response, equity, total_pnl, realized_pnl,
            floating_pnl, margin, open_positions, synced_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(account_id) DO UPDATE SET
            raw_response = excluded.raw_response,
            equity = excluded.equity,
            total_pnl = excluded.total_pnl,
            realized_pnl = excluded.realized_pnl,
            floating_pnl = excluded.floating_pnl,
            margin = excluded.margin,
            open_positions = excluded.open_positions,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(account_id)
    .bind(raw_response)
    .bind(stats.equity)
    .bind(stats.total_pnl)
    .bind(stats.realized_pnl)
    .bind(stats.floating_pnl)
    .bind(stats.margin)
    .bind(stats.open_positions)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    find_by_account(pool, account_id)
        .await?
        .ok_or(PersistenceError::MissingId)
}

pub async fn find_by_account(
    pool: &SqlitePool,
    account_id: i64,
) -> Result<Option<Snapshot>, PersistenceError> {
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE account_id = ?1"
    ))
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    row.map(Snapshot::try_from).transpose()
}

pub async fn get_by_account(pool: &SqlitePool, account_id: i64) -> Result<Snapshot, LeagueError> {
    find_by_account(pool, account_id)
        .await?
        .ok_or_else(|| LeagueError::not_found("Snapshot for account", account_id))
}

/// All snapshots ordered by rank. Before the first ranking pass, falls back
/// to realized P&L descending with missing P&L last.
pub async fn list_snapshots_by_rank(pool: &SqlitePool) -> Result<Vec<Snapshot>, PersistenceError> {
    let ranked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots WHERE rank IS NOT NULL")
        .fetch_one(pool)
        .await?;

    let order = if ranked > 0 {
        "rank IS NULL, rank ASC, account_id ASC"
    } else {
        "realized_pnl IS NULL, realized_pnl DESC, account_id ASC"
    };

    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots ORDER BY {order}"
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Snapshot::try_from).collect()
}

/// Most recent time a ranking pass wrote ranks, if any.
pub async fn last_ranked_at(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        r#"
        SELECT last_ranked_at FROM snapshots
        WHERE last_ranked_at IS NOT NULL
        ORDER BY last_ranked_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(latest.flatten())
}

/// Accounts with a realized P&L, best first, optionally limited to one
/// league.
pub async fn leaderboard(
    pool: &SqlitePool,
    league_id: Option<i64>,
) -> Result<Vec<LeaderboardEntry>, PersistenceError> {
    let rows = sqlx::query_as::<_, LeaderboardRow>(
        r#"
        SELECT
            s.rank, s.account_id, a.login, a.league_id, u.id AS user_id,
            u.email, u.first_name, u.last_name, u.image_url,
            s.realized_pnl, s.total_pnl, s.equity, s.synced_at
        FROM snapshots s
        JOIN accounts a ON a.id = s.account_id
        JOIN users u ON u.id = a.user_id
        WHERE s.realized_pnl IS NOT NULL
          AND (?1 IS NULL OR a.league_id = ?1)
        ORDER BY s.rank IS NULL, s.rank ASC, s.realized_pnl DESC, s.account_id ASC
        "#,
    )
    .bind(league_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| row.into_entry(index + 1))
        .collect())
}
