use serde::Serialize;
use sqlx::SqlitePool;
use std::io::Write;
use std::str::FromStr;

use crate::error::LeagueError;
use crate::payments::{self, PaymentFilter};
use crate::snapshots;
use crate::users::{self, UserQuery};

const EXPORT_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportKind {
    Users,
    Payments,
    Leaderboard,
}

impl ExportKind {
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Users => "users.csv",
            Self::Payments => "payments.csv",
            Self::Leaderboard => "leaderboard.csv",
        }
    }
}

impl FromStr for ExportKind {
    type Err = LeagueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(Self::Users),
            "payments" => Ok(Self::Payments),
            "leaderboard" => Ok(Self::Leaderboard),
            other => Err(LeagueError::Validation(format!("unknown export {other}"))),
        }
    }
}

#[derive(Serialize)]
struct UserRecord<'a> {
    id: i64,
    external_id: &'a str,
    email: &'a str,
    name: String,
    referral_code: &'a str,
    status: &'static str,
    created_at: String,
}

#[derive(Serialize)]
struct PaymentRecord<'a> {
    id: i64,
    order_id: &'a str,
    user_id: i64,
    league_id: Option<i64>,
    amount: String,
    currency: &'a str,
    status: &'static str,
    invoice_id: Option<&'a str>,
    created_at: String,
}

#[derive(Serialize)]
struct LeaderboardRecord<'a> {
    position: usize,
    rank: Option<i64>,
    name: &'a str,
    login: Option<&'a str>,
    league_id: Option<i64>,
    realized_pnl: Option<f64>,
    total_pnl: Option<f64>,
    equity: Option<f64>,
    synced_at: String,
}

fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Writes the requested export as CSV with a header row.
pub async fn write_export<W: Write>(
    pool: &SqlitePool,
    kind: ExportKind,
    writer: W,
) -> Result<(), LeagueError> {
    let mut csv = csv::Writer::from_writer(writer);

    match kind {
        ExportKind::Users => {
            let mut offset = 0;
            loop {
                let page = users::list_users(
                    pool,
                    &UserQuery {
                        limit: Some(EXPORT_PAGE_SIZE),
                        offset: Some(offset),
                        ..UserQuery::default()
                    },
                )
                .await?;

                for user in &page.users {
                    csv.serialize(UserRecord {
                        id: user.id,
                        external_id: &user.external_id,
                        email: &user.email,
                        name: user.display_name(),
                        referral_code: &user.referral_code,
                        status: user.status.as_str(),
                        created_at: user.created_at.to_rfc3339(),
                    })?;
                }

                if page.users.len() < EXPORT_PAGE_SIZE as usize {
                    break;
                }
                offset += EXPORT_PAGE_SIZE;
            }
        }
        ExportKind::Payments => {
            for payment in payments::list_payments(pool, &PaymentFilter::default()).await? {
                csv.serialize(PaymentRecord {
                    id: payment.id,
                    order_id: &payment.order_id,
                    user_id: payment.user_id,
                    league_id: payment.league_id,
                    amount: format_cents(payment.amount_cents),
                    currency: &payment.currency,
                    status: payment.status.as_str(),
                    invoice_id: payment.invoice_id.as_deref(),
                    created_at: payment.created_at.to_rfc3339(),
                })?;
            }
        }
        ExportKind::Leaderboard => {
            for entry in snapshots::leaderboard(pool, None).await? {
                csv.serialize(LeaderboardRecord {
                    position: entry.position,
                    rank: entry.rank,
                    name: &entry.display_name,
                    login: entry.login.as_deref(),
                    league_id: entry.league_id,
                    realized_pnl: entry.realized_pnl,
                    total_pnl: entry.total_pnl,
                    equity: entry.equity,
                    synced_at: entry.synced_at.to_rfc3339(),
                })?;
            }
        }
    }

    csv.flush().map_err(|e| LeagueError::Csv(e.into()))?;
    Ok(())
}

pub async fn export_to_string(pool: &SqlitePool, kind: ExportKind) -> Result<String, LeagueError> {
    let mut buffer = Vec::new();
    write_export(pool, kind, &mut buffer).await?;
    String::from_utf8(buffer)
        .map_err(|e| LeagueError::Validation(format!("export produced invalid UTF-8: {e}")))
}
