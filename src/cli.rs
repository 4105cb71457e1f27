use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use league_broker::Broker;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::admins::{AdminRole, create_admin};
use crate::env::Env;
use crate::export::{ExportKind, write_export};
use crate::leagues::{NewLeague, create_league};
use crate::ranking::update_rankings;
use crate::sync::{CycleOutcome, SyncConfig, run_sync_cycle};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to create export file {path}: {source}")]
    ExportFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sync every account's snapshot and recompute rankings once
    Sync,
    /// Recompute rankings from the stored snapshots
    Rank,
    /// Create an admin and print their access key
    CreateAdmin {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_enum, default_value = "admin")]
        role: AdminRole,
    },
    /// Export users, payments or the leaderboard as CSV
    Export {
        #[arg(value_enum)]
        kind: ExportKind,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create a league. Without explicit dates it runs over the next
    /// competition week.
    CreateLeague {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        start_at: Option<DateTime<Utc>>,
        #[arg(long)]
        end_at: Option<DateTime<Utc>>,
        #[arg(long, default_value = "0")]
        entry_fee_cents: i64,
        #[arg(long, default_value = "0")]
        reward_cents: i64,
        /// Comma separated percentages per finishing position, e.g. 50,30,20
        #[arg(long, value_delimiter = ',')]
        prize_distribution: Vec<Decimal>,
        #[arg(long)]
        max_participants: Option<i64>,
    },
}

#[derive(Debug, Parser)]
#[command(name = "league-cli")]
#[command(about = "Operational commands for the Leadership League backend")]
#[command(version)]
pub struct CliEnv {
    #[clap(flatten)]
    pub env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    pub fn parse_and_convert() -> anyhow::Result<(Env, Commands)> {
        let cli_env = Self::try_parse()?;
        Ok((cli_env.env, cli_env.command))
    }
}

pub async fn run_command(env: Env, command: Commands) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    run_command_with_writers(&pool, &env, command, &mut std::io::stdout()).await
}

async fn run_command_with_writers<W: Write>(
    pool: &SqlitePool,
    env: &Env,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Sync => {
            let broker = env.get_broker()?;
            execute_sync(pool, broker.as_ref(), &env.get_sync_config(), stdout).await?;
        }
        Commands::Rank => {
            let outcome = update_rankings(pool).await?;
            writeln!(
                stdout,
                "Ranked {} accounts, {} without realized P&L",
                outcome.ranked, outcome.unranked
            )?;
        }
        Commands::CreateAdmin { email, name, role } => {
            let created = create_admin(pool, &email, &name, role).await?;
            writeln!(
                stdout,
                "Created {} {} (id {})",
                created.admin.role.as_str(),
                created.admin.email,
                created.admin.id
            )?;
            writeln!(stdout, "Access key: {}", created.access_key)?;
            writeln!(stdout, "Store it now, it cannot be shown again.")?;
        }
        Commands::Export { kind, output } => match output {
            Some(path) => {
                let file = std::fs::File::create(&path).map_err(|source| CliError::ExportFile {
                    path: path.clone(),
                    source,
                })?;
                write_export(pool, kind, file).await?;
                writeln!(stdout, "Wrote {} to {}", kind.file_name(), path.display())?;
            }
            None => write_export(pool, kind, &mut *stdout).await?,
        },
        Commands::CreateLeague {
            name,
            description,
            start_at,
            end_at,
            entry_fee_cents,
            reward_cents,
            prize_distribution,
            max_participants,
        } => {
            let league = create_league(
                pool,
                &NewLeague {
                    name,
                    description,
                    start_at,
                    end_at,
                    entry_fee_cents,
                    reward_cents,
                    prize_distribution,
                    max_participants,
                },
                None,
            )
            .await?;
            writeln!(
                stdout,
                "Created league {} \"{}\" from {} to {}",
                league.id, league.name, league.start_at, league.end_at
            )?;
        }
    }

    info!("CLI operation completed successfully");
    Ok(())
}

async fn execute_sync<W: Write>(
    pool: &SqlitePool,
    broker: &dyn Broker,
    config: &SyncConfig,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match run_sync_cycle(pool, broker, config).await? {
        CycleOutcome::Completed { run, report } => {
            writeln!(
                stdout,
                "Synced {}/{} accounts, ranked {}",
                report.synced, report.total, run.ranked
            )?;
            for failure in &report.failed {
                writeln!(
                    stdout,
                    "  account {} (login {}): {}",
                    failure.account_id, failure.login, failure.error
                )?;
            }
        }
        CycleOutcome::Skipped => {
            writeln!(stdout, "Another sync is already running, nothing done")?;
        }
    }
    Ok(())
}
