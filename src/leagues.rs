use chrono::{DateTime, Datelike, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::error::{LeagueError, PersistenceError};
use crate::money::percent_of_cents;
use crate::settings;
use crate::snapshots;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeagueStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl LeagueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Scheduled | Self::Active, Self::Cancelled)
        )
    }
}

impl FromStr for LeagueStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(PersistenceError::InvalidEnumValue {
                column: "leagues.status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct League {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: LeagueStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub entry_fee_cents: i64,
    pub reward_cents: i64,
    /// Share of the prize pool, in percent, per finishing position.
    pub prize_distribution: Vec<Decimal>,
    pub max_participants: Option<i64>,
    pub created_by_admin_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LeagueRow {
    id: i64,
    name: String,
    description: Option<String>,
    status: String,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    entry_fee_cents: i64,
    reward_cents: i64,
    prize_distribution: String,
    max_participants: Option<i64>,
    created_by_admin_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LeagueRow> for League {
    type Error = PersistenceError;

    fn try_from(row: LeagueRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            status: row.status.parse()?,
            start_at: row.start_at,
            end_at: row.end_at,
            entry_fee_cents: row.entry_fee_cents,
            reward_cents: row.reward_cents,
            prize_distribution: serde_json::from_str(&row.prize_distribution).map_err(
                |source| PersistenceError::InvalidJson {
                    column: "leagues.prize_distribution",
                    source,
                },
            )?,
            max_participants: row.max_participants,
            created_by_admin_id: row.created_by_admin_id,
            created_at: row.created_at,
        })
    }
}

const LEAGUE_COLUMNS: &str = "id, name, description, status, start_at, end_at, entry_fee_cents, \
                              reward_cents, prize_distribution, max_participants, \
                              created_by_admin_id, created_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewLeague {
    pub name: String,
    pub description: Option<String>,
    /// Defaults to the next weekly window in the competition timezone.
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub entry_fee_cents: i64,
    pub reward_cents: i64,
    #[serde(default)]
    pub prize_distribution: Vec<Decimal>,
    pub max_participants: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LeagueUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub entry_fee_cents: Option<i64>,
    pub reward_cents: Option<i64>,
    pub prize_distribution: Option<Vec<Decimal>>,
    pub max_participants: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeagueSummary {
    #[serde(flatten)]
    pub league: League,
    pub participant_pool: i64,
    pub collected_entry_fees_cents: i64,
    pub calculated_prize_pool_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payout {
    pub position: usize,
    pub account_id: i64,
    pub user_id: i64,
    pub realized_pnl: Option<f64>,
    pub amount_cents: i64,
}

fn validate_prize_distribution(distribution: &[Decimal]) -> Result<(), LeagueError> {
    if distribution.iter().any(|share| *share <= Decimal::ZERO) {
        return Err(LeagueError::Validation(
            "prize distribution shares must be positive".to_string(),
        ));
    }

    let total: Decimal = distribution.iter().sum();
    if total > Decimal::ONE_HUNDRED {
        return Err(LeagueError::Validation(format!(
            "prize distribution sums to {total}%, more than 100%"
        )));
    }

    Ok(())
}

/// Upper bound for entry fees and base rewards (one billion in currency units).
const MAX_AMOUNT_CENTS: i64 = 100_000_000_000;

fn validate_amounts(entry_fee_cents: i64, reward_cents: i64) -> Result<(), LeagueError> {
    if entry_fee_cents < 0 || reward_cents < 0 {
        return Err(LeagueError::Validation(
            "entry fee and reward must not be negative".to_string(),
        ));
    }
    if entry_fee_cents > MAX_AMOUNT_CENTS || reward_cents > MAX_AMOUNT_CENTS {
        return Err(LeagueError::Validation(format!(
            "entry fee and reward must not exceed {MAX_AMOUNT_CENTS} cents"
        )));
    }
    Ok(())
}

fn validate_max_participants(max_participants: Option<i64>) -> Result<(), LeagueError> {
    match max_participants {
        Some(max) if max <= 0 => Err(LeagueError::Validation(
            "max participants must be positive".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Returns the competition week following `now`: from the next Monday
/// 00:00 to the Monday after, both in the competition timezone.
pub fn next_weekly_window(now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_today = now.with_timezone(&tz).date_naive();
    let days_until_monday = 7 - u64::from(local_today.weekday().num_days_from_monday());

    let start_date = local_today + Days::new(days_until_monday);
    let end_date = start_date + Days::new(7);

    let local_midnight = |date: chrono::NaiveDate| {
        let naive = date.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive))
            .with_timezone(&Utc)
    };

    (local_midnight(start_date), local_midnight(end_date))
}

pub async fn create_league(
    pool: &SqlitePool,
    new_league: &NewLeague,
    admin_id: Option<i64>,
) -> Result<League, LeagueError> {
    if new_league.name.trim().is_empty() {
        return Err(LeagueError::Validation("league name is required".to_string()));
    }
    validate_amounts(new_league.entry_fee_cents, new_league.reward_cents)?;
    validate_prize_distribution(&new_league.prize_distribution)?;
    validate_max_participants(new_league.max_participants)?;

    let (start_at, end_at) = match (new_league.start_at, new_league.end_at) {
        (Some(start_at), Some(end_at)) => (start_at, end_at),
        (None, None) => {
            let tz = settings::competition_timezone(pool).await?;
            next_weekly_window(Utc::now(), tz)
        }
        _ => {
            return Err(LeagueError::Validation(
                "start and end must be given together".to_string(),
            ));
        }
    };

    if end_at <= start_at {
        return Err(LeagueError::Validation(
            "league must end after it starts".to_string(),
        ));
    }

    let distribution = serde_json::to_string(&new_league.prize_distribution).map_err(|source| {
        PersistenceError::InvalidJson {
            column: "leagues.prize_distribution",
            source,
        }
    })?;

    let result = sqlx::query(
        r#"
        INSERT INTO leagues (
            name, description, status, start_at, end_at, entry_fee_cents, reward_cents,
            prize_distribution, max_participants, created_by_admin_id, created_at
        )
        VALUES (?1, ?2, 'scheduled', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(new_league.name.trim())
    .bind(&new_league.description)
    .bind(start_at)
    .bind(end_at)
    .bind(new_league.entry_fee_cents)
    .bind(new_league.reward_cents)
    .bind(distribution)
    .bind(new_league.max_participants)
    .bind(admin_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let league = get_league(pool, result.last_insert_rowid()).await?;
    info!(
        "Created league {} '{}' ({} to {})",
        league.id, league.name, league.start_at, league.end_at
    );

    Ok(league)
}

pub async fn find_league(pool: &SqlitePool, id: i64) -> Result<Option<League>, PersistenceError> {
    let row = sqlx::query_as::<_, LeagueRow>(&format!(
        "SELECT {LEAGUE_COLUMNS} FROM leagues WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(League::try_from).transpose()
}

pub async fn get_league(pool: &SqlitePool, id: i64) -> Result<League, LeagueError> {
    find_league(pool, id)
        .await?
        .ok_or_else(|| LeagueError::not_found("League", id))
}

pub async fn list_leagues(
    pool: &SqlitePool,
    status: Option<LeagueStatus>,
) -> Result<Vec<League>, PersistenceError> {
    let rows = sqlx::query_as::<_, LeagueRow>(&format!(
        r#"
        SELECT {LEAGUE_COLUMNS} FROM leagues
        WHERE (?1 IS NULL OR status = ?1)
        ORDER BY start_at DESC, id DESC
        "#
    ))
    .bind(status.map(LeagueStatus::as_str))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(League::try_from).collect()
}

pub async fn update_league(
    pool: &SqlitePool,
    id: i64,
    update: &LeagueUpdate,
) -> Result<League, LeagueError> {
    let current = get_league(pool, id).await?;

    if current.status.is_terminal() {
        return Err(LeagueError::Conflict(format!(
            "league {id} is {} and can no longer be edited",
            current.status.as_str()
        )));
    }

    let name = update.name.clone().unwrap_or(current.name);
    if name.trim().is_empty() {
        return Err(LeagueError::Validation("league name is required".to_string()));
    }

    let entry_fee_cents = update.entry_fee_cents.unwrap_or(current.entry_fee_cents);
    let reward_cents = update.reward_cents.unwrap_or(current.reward_cents);
    validate_amounts(entry_fee_cents, reward_cents)?;

    let prize_distribution = update
        .prize_distribution
        .clone()
        .unwrap_or(current.prize_distribution);
    validate_prize_distribution(&prize_distribution)?;

    let max_participants = update.max_participants.or(current.max_participants);
    validate_max_participants(max_participants)?;

    let distribution = serde_json::to_string(&prize_distribution).map_err(|source| {
        PersistenceError::InvalidJson {
            column: "leagues.prize_distribution",
            source,
        }
    })?;

    sqlx::query(
        r#"
        UPDATE leagues
        SET name = ?1, description = ?2, entry_fee_cents = ?3, reward_cents = ?4,
            prize_distribution = ?5, max_participants = ?6
        WHERE id = ?7
        "#,
    )
    .bind(name.trim())
    .bind(update.description.clone().or(current.description))
    .bind(entry_fee_cents)
    .bind(reward_cents)
    .bind(distribution)
    .bind(max_participants)
    .bind(id)
    .execute(pool)
    .await?;

    get_league(pool, id).await
}

pub async fn set_league_status(
    pool: &SqlitePool,
    id: i64,
    status: LeagueStatus,
) -> Result<League, LeagueError> {
    let current = get_league(pool, id).await?;

    if !current.status.can_transition_to(status) {
        return Err(LeagueError::Conflict(format!(
            "league {id} cannot move from {} to {}",
            current.status.as_str(),
            status.as_str()
        )));
    }

    sqlx::query("UPDATE leagues SET status = ?1 WHERE id = ?2 AND status = ?3")
        .bind(status.as_str())
        .bind(id)
        .bind(current.status.as_str())
        .execute(pool)
        .await?;

    info!(
        "League {id} moved from {} to {}",
        current.status.as_str(),
        status.as_str()
    );

    get_league(pool, id).await
}

pub async fn participant_count(pool: &SqlitePool, league_id: i64) -> Result<i64, PersistenceError> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM accounts WHERE league_id = ?1")
        .bind(league_id)
        .fetch_one(pool)
        .await?;

    Ok(count)
}

pub async fn collected_entry_fees(
    pool: &SqlitePool,
    league_id: i64,
) -> Result<i64, PersistenceError> {
    let total = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0) FROM payments
        WHERE league_id = ?1 AND status = 'success'
        "#,
    )
    .bind(league_id)
    .fetch_one(pool)
    .await?;

    Ok(total)
}

/// Fails unless the league can take another participant.
pub async fn ensure_accepting_entries(
    pool: &SqlitePool,
    league: &League,
) -> Result<(), LeagueError> {
    if league.status.is_terminal() {
        return Err(LeagueError::Conflict(format!(
            "league {} is {}",
            league.id,
            league.status.as_str()
        )));
    }

    if let Some(max) = league.max_participants {
        let participants = participant_count(pool, league.id).await?;
        if participants >= max {
            return Err(LeagueError::Conflict(format!(
                "league {} is full ({participants}/{max})",
                league.id
            )));
        }
    }

    Ok(())
}

pub async fn league_summary(pool: &SqlitePool, id: i64) -> Result<LeagueSummary, LeagueError> {
    let league = get_league(pool, id).await?;
    summarize(pool, league).await
}

pub async fn list_league_summaries(
    pool: &SqlitePool,
    status: Option<LeagueStatus>,
) -> Result<Vec<LeagueSummary>, LeagueError> {
    let mut summaries = Vec::new();
    for league in list_leagues(pool, status).await? {
        summaries.push(summarize(pool, league).await?);
    }
    Ok(summaries)
}

async fn summarize(pool: &SqlitePool, league: League) -> Result<LeagueSummary, LeagueError> {
    let participant_pool = participant_count(pool, league.id).await?;
    let collected = collected_entry_fees(pool, league.id).await?;
    let share = settings::prize_pool_share_percent(pool).await?;
    let calculated_prize_pool_cents = league
        .reward_cents
        .checked_add(percent_of_cents(collected, share)?)
        .ok_or_else(|| {
            LeagueError::Validation(format!("prize pool of league {} overflows", league.id))
        })?;

    Ok(LeagueSummary {
        league,
        participant_pool,
        collected_entry_fees_cents: collected,
        calculated_prize_pool_cents,
    })
}

/// Splits the league's prize pool over its current standings according to
/// the prize distribution. Positions without a share get nothing and are
/// omitted.
pub async fn payouts(pool: &SqlitePool, id: i64) -> Result<Vec<Payout>, LeagueError> {
    let summary = league_summary(pool, id).await?;
    let standings = snapshots::leaderboard(pool, Some(id)).await?;

    standings
        .iter()
        .zip(&summary.league.prize_distribution)
        .map(|(entry, share)| {
            Ok(Payout {
                position: entry.position,
                account_id: entry.account_id,
                user_id: entry.user_id,
                realized_pnl: entry.realized_pnl,
                amount_cents: percent_of_cents(summary.calculated_prize_pool_cents, *share)?,
            })
        })
        .collect()
}
