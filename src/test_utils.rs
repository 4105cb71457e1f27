use chrono::{Duration, TimeZone, Utc};
use rust_decimal_macros::dec;
use sqlx::SqlitePool;

use crate::accounts::{Account, NewAccount, create_account};
use crate::leagues::{League, NewLeague, create_league};
use crate::payments::{Payment, insert_pending_payment};
use crate::users::{IdentityProfile, User, upsert_from_identity};

/// Centralized test database setup to eliminate duplication across test files.
/// Creates an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// Creates a user named `{name} Tester` with email `{name}@example.com`.
pub async fn create_test_user(pool: &SqlitePool, name: &str) -> User {
    upsert_from_identity(
        pool,
        &IdentityProfile {
            external_id: format!("user_{name}"),
            email: format!("{name}@example.com"),
            first_name: Some(name.to_string()),
            last_name: Some("Tester".to_string()),
            image_url: None,
            referral_code: None,
        },
    )
    .await
    .unwrap()
    .user
}

/// Creates a scheduled week-long league with a 50 USD entry fee, a
/// 1000 USD base reward and a 50/30/20 prize split.
pub async fn create_test_league(pool: &SqlitePool, name: &str) -> League {
    let start_at = Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap();

    create_league(
        pool,
        &NewLeague {
            name: name.to_string(),
            description: None,
            start_at: Some(start_at),
            end_at: Some(start_at + Duration::days(7)),
            entry_fee_cents: 5_000,
            reward_cents: 100_000,
            prize_distribution: vec![dec!(50), dec!(30), dec!(20)],
            max_participants: None,
        },
        None,
    )
    .await
    .unwrap()
}

pub async fn create_test_payment(
    pool: &SqlitePool,
    user_id: i64,
    league_id: Option<i64>,
    amount_cents: i64,
) -> Payment {
    insert_pending_payment(pool, user_id, league_id, amount_cents, "USD")
        .await
        .unwrap()
}

pub async fn create_test_account(
    pool: &SqlitePool,
    user_id: i64,
    league_id: Option<i64>,
    login: Option<&str>,
) -> Account {
    create_account(
        pool,
        &NewAccount {
            user_id,
            league_id,
            payment_id: None,
            login: login.map(str::to_string),
            password_encrypted: None,
            server: Some("TEST".to_string()),
            group_name: "contest\\default".to_string(),
            leverage: 100,
            deposit_cents: 1_000_000,
        },
    )
    .await
    .unwrap()
}

/// Stores a snapshot for the account with the given realized P&L and no
/// rank, as a sync would before the ranking pass.
pub async fn insert_snapshot_with_pnl(
    pool: &SqlitePool,
    account_id: i64,
    realized_pnl: Option<f64>,
) {
    sqlx::query(
        r#"
        INSERT INTO snapshots (account_id, raw_response, equity, total_pnl, realized_pnl, synced_at)
        VALUES (?1, '{}', 10000.0, ?2, ?2, ?3)
        "#,
    )
    .bind(account_id)
    .bind(realized_pnl)
    .bind(Utc::now())
    .execute(pool)
    .await
    .unwrap();
}
