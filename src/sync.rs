//! Snapshot synchronization pipeline.
//!
//! A cycle fetches broker stats for every account with a login, upserts each
//! account's snapshot and then recomputes the global ranking. Per-account
//! failures are logged and reported; they never abort the cycle.

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use league_broker::{Broker, DynBroker, Login, StatsRange, UserStatsRequest};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::accounts::{self, Account};
use crate::activities::{ActivityKind, Actor, record_activity};
use crate::admins;
use crate::error::{LeagueError, PersistenceError};
use crate::lock::{release_job_lease, try_acquire_job_lease};
use crate::ranking::{self, RankingOutcome};
use crate::snapshots::{self, Snapshot};

const SNAPSHOT_SYNC_JOB: &str = "snapshot_sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub concurrency: usize,
    /// How long a cycle may hold the job lease before others may take it.
    pub lease: chrono::Duration,
    pub admin_session_timeout: chrono::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            concurrency: 4,
            lease: chrono::Duration::minutes(25),
            admin_session_timeout: chrono::Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub account_id: i64,
    pub login: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub synced: usize,
    pub failed: Vec<SyncFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accounts_total: i64,
    pub accounts_synced: i64,
    pub accounts_failed: i64,
    pub ranked: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed {
        run: SyncRun,
        report: SyncReport,
    },
    /// Another holder owns the sync lease.
    Skipped,
}

/// Fetches the account's current stats and stores them as its snapshot.
pub async fn sync_account(
    pool: &SqlitePool,
    broker: &dyn Broker,
    account: &Account,
    range: Option<StatsRange>,
) -> Result<Snapshot, LeagueError> {
    let login = account
        .login
        .as_deref()
        .filter(|login| !login.is_empty())
        .ok_or_else(|| {
            LeagueError::Validation(format!("account {} has no broker login", account.id))
        })?;

    let mut request = UserStatsRequest::new(Login(login.to_string()));
    if let Some(range) = range {
        request = request.with_range(range);
    }

    let stats = broker.user_stats(&request).await?;
    debug!(
        "Fetched stats for account {} (login {login}): realized P&L {:?}",
        account.id, stats.realized_pnl
    );

    Ok(snapshots::upsert_snapshot(pool, account.id, &stats).await?)
}

pub async fn sync_account_by_id(
    pool: &SqlitePool,
    broker: &dyn Broker,
    account_id: i64,
    range: Option<StatsRange>,
) -> Result<Snapshot, LeagueError> {
    let account = accounts::get_account(pool, account_id).await?;
    sync_account(pool, broker, &account, range).await
}

/// Syncs every account with a login, at most `concurrency` at a time.
#[instrument(skip(pool, broker))]
pub async fn sync_all_snapshots(
    pool: &SqlitePool,
    broker: &dyn Broker,
    concurrency: usize,
) -> Result<SyncReport, PersistenceError> {
    let accounts = accounts::list_accounts_with_login(pool).await?;
    let total = accounts.len();

    if accounts.is_empty() {
        info!("No accounts with a broker login to sync");
        return Ok(SyncReport::default());
    }

    info!("Syncing snapshots for {total} accounts");

    let results: Vec<(Account, Result<Snapshot, LeagueError>)> = stream::iter(accounts)
        .map(|account| async move {
            let result = sync_account(pool, broker, &account, None).await;
            (account, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = SyncReport {
        total,
        ..SyncReport::default()
    };

    for (account, result) in results {
        match result {
            Ok(_) => report.synced += 1,
            Err(e) => {
                let login = account.login.unwrap_or_default();
                error!("Failed to sync snapshot for account {} (login {login}): {e}", account.id);
                report.failed.push(SyncFailure {
                    account_id: account.id,
                    login,
                    error: e.to_string(),
                });
            }
        }
    }

    report.failed.sort_by_key(|failure| failure.account_id);

    info!(
        "Snapshot sync finished: {} synced, {} failed of {}",
        report.synced,
        report.failed.len(),
        report.total
    );

    Ok(report)
}

async fn record_sync_run(
    pool: &SqlitePool,
    started_at: DateTime<Utc>,
    report: &SyncReport,
    ranking: RankingOutcome,
) -> Result<SyncRun, PersistenceError> {
    let to_i64 = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);

    let run = sqlx::query_as::<_, SyncRun>(
        r#"
        INSERT INTO sync_runs
            (started_at, finished_at, accounts_total, accounts_synced, accounts_failed, ranked)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING
            id, started_at, finished_at, accounts_total, accounts_synced, accounts_failed, ranked
        "#,
    )
    .bind(started_at)
    .bind(Utc::now())
    .bind(to_i64(report.total))
    .bind(to_i64(report.synced))
    .bind(to_i64(report.failed.len()))
    .bind(to_i64(ranking.ranked))
    .fetch_one(pool)
    .await?;

    Ok(run)
}

/// Runs one full sync and ranking pass under the sync lease.
#[instrument(skip(pool, broker, config))]
pub async fn run_sync_cycle(
    pool: &SqlitePool,
    broker: &dyn Broker,
    config: &SyncConfig,
) -> Result<CycleOutcome, LeagueError> {
    let holder = Uuid::new_v4().to_string();

    if !try_acquire_job_lease(pool, SNAPSHOT_SYNC_JOB, &holder, config.lease).await? {
        warn!("Snapshot sync already running elsewhere, skipping this cycle");
        return Ok(CycleOutcome::Skipped);
    }

    let result = sync_and_rank(pool, broker, config).await;

    if let Err(e) = release_job_lease(pool, SNAPSHOT_SYNC_JOB, &holder).await {
        error!("Failed to release snapshot sync lease: {e}");
    }

    result
}

async fn sync_and_rank(
    pool: &SqlitePool,
    broker: &dyn Broker,
    config: &SyncConfig,
) -> Result<CycleOutcome, LeagueError> {
    let started_at = Utc::now();

    let report = sync_all_snapshots(pool, broker, config.concurrency).await?;
    let ranking = ranking::update_rankings(pool).await?;
    let run = record_sync_run(pool, started_at, &report, ranking).await?;

    record_activity(
        pool,
        ActivityKind::SnapshotSync,
        &format!(
            "Synced {}/{} accounts, {} failed, {} ranked",
            report.synced,
            report.total,
            report.failed.len(),
            ranking.ranked
        ),
        Actor::SYSTEM,
    )
    .await?;

    Ok(CycleOutcome::Completed { run, report })
}

pub async fn list_sync_runs(
    pool: &SqlitePool,
    limit: u32,
) -> Result<Vec<SyncRun>, PersistenceError> {
    let runs = sqlx::query_as::<_, SyncRun>(
        r#"
        SELECT id, started_at, finished_at, accounts_total, accounts_synced, accounts_failed, ranked
        FROM sync_runs
        ORDER BY started_at DESC, id DESC
        LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(runs)
}

/// Periodically runs sync cycles until shutdown is signalled.
pub struct SyncScheduler {
    config: SyncConfig,
    pool: SqlitePool,
    broker: DynBroker,
    interval: Interval,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncScheduler {
    pub fn new(
        config: SyncConfig,
        pool: SqlitePool,
        broker: DynBroker,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut interval = interval(config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            config,
            pool,
            broker,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Starting snapshot sync scheduler with interval: {:?}",
            self.config.interval
        );

        loop {
            tokio::select! {
                _ = self.interval.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Received shutdown signal, stopping snapshot sync scheduler");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        match run_sync_cycle(&self.pool, self.broker.as_ref(), &self.config).await {
            Ok(CycleOutcome::Completed { run, .. }) => {
                debug!("Sync run {} recorded", run.id);
            }
            Ok(CycleOutcome::Skipped) => {}
            Err(e) => error!("Snapshot sync cycle failed: {e}"),
        }

        match admins::purge_idle_sessions(&self.pool, self.config.admin_session_timeout).await {
            Ok(0) => {}
            Ok(purged) => info!("Purged {purged} idle admin sessions"),
            Err(e) => error!("Failed to purge idle admin sessions: {e}"),
        }
    }
}
