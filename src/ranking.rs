use chrono::Utc;
use sqlx::SqlitePool;
use std::cmp::Ordering;
use tracing::{info, instrument};

use crate::error::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct RankInput {
    pub account_id: i64,
    pub realized_pnl: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankAssignment {
    pub account_id: i64,
    pub rank: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RankingOutcome {
    pub ranked: usize,
    pub unranked: usize,
}

/// Orders accounts by realized P&L, best first, ignoring those without one.
/// Equal P&L is ordered by account id so the result is deterministic.
pub fn compute_rankings(inputs: &[RankInput]) -> Vec<RankAssignment> {
    let mut eligible: Vec<(i64, f64)> = inputs
        .iter()
        .filter_map(|input| {
            input
                .realized_pnl
                .filter(|pnl| !pnl.is_nan())
                .map(|pnl| (input.account_id, pnl))
        })
        .collect();

    eligible.sort_by(|(a_id, a_pnl), (b_id, b_pnl)| {
        b_pnl
            .partial_cmp(a_pnl)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a_id.cmp(b_id))
    });

    eligible
        .into_iter()
        .zip(1_i64..)
        .map(|((account_id, _), rank)| RankAssignment { account_id, rank })
        .collect()
}

/// Recomputes the global ranking over every snapshot in one transaction.
#[instrument(skip(pool))]
pub async fn update_rankings(pool: &SqlitePool) -> Result<RankingOutcome, PersistenceError> {
    let mut sql_tx = pool.begin().await?;

    let inputs = sqlx::query_as::<_, RankInput>("SELECT account_id, realized_pnl FROM snapshots")
        .fetch_all(sql_tx.as_mut())
        .await?;

    let assignments = compute_rankings(&inputs);
    let ranked_at = Utc::now();

    sqlx::query("UPDATE snapshots SET rank = NULL WHERE realized_pnl IS NULL")
        .execute(sql_tx.as_mut())
        .await?;

    for assignment in &assignments {
        sqlx::query("UPDATE snapshots SET rank = ?1, last_ranked_at = ?2 WHERE account_id = ?3")
            .bind(assignment.rank)
            .bind(ranked_at)
            .bind(assignment.account_id)
            .execute(sql_tx.as_mut())
            .await?;
    }

    sql_tx.commit().await?;

    let outcome = RankingOutcome {
        ranked: assignments.len(),
        unranked: inputs.len() - assignments.len(),
    };
    info!(
        "Ranked {} snapshots, {} without realized P&L",
        outcome.ranked, outcome.unranked
    );

    Ok(outcome)
}
