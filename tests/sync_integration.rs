use httpmock::prelude::*;
use leadership_league::accounts::{Account, NewAccount, create_account};
use leadership_league::snapshots::{find_by_account, leaderboard};
use leadership_league::sync::{CycleOutcome, SyncConfig, list_sync_runs, run_sync_cycle};
use leadership_league::users::{IdentityProfile, upsert_from_identity};
use league_broker::{BrokerEnv, Mt5Broker};
use serde_json::json;
use sqlx::SqlitePool;

async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

async fn create_trader(pool: &SqlitePool, name: &str, login: Option<&str>) -> Account {
    let user = upsert_from_identity(
        pool,
        &IdentityProfile {
            external_id: format!("user_{name}"),
            email: format!("{name}@example.com"),
            first_name: Some(name.to_string()),
            last_name: None,
            image_url: None,
            referral_code: None,
        },
    )
    .await
    .unwrap()
    .user;

    create_account(
        pool,
        &NewAccount {
            user_id: user.id,
            league_id: None,
            payment_id: None,
            login: login.map(str::to_string),
            password_encrypted: None,
            server: Some("Contest-Live".to_string()),
            group_name: "contest\\default".to_string(),
            leverage: 100,
            deposit_cents: 1_000_000,
        },
    )
    .await
    .unwrap()
}

fn stats_body(realized_pnl: f64) -> serde_json::Value {
    json!({
        "snapshot": {"equity": 10_000.0 + realized_pnl, "margin": 0.0, "open_positions": 0},
        "total_pnl": realized_pnl,
        "realized_pnl": realized_pnl,
        "floating_pnl": 0.0
    })
}

#[tokio::test]
async fn test_sync_cycle_ranks_accounts_from_broker_stats() {
    let server = MockServer::start();
    let pool = setup_test_db().await;

    let alice = create_trader(&pool, "alice", Some("1001")).await;
    let bob = create_trader(&pool, "bob", Some("1002")).await;
    let carol = create_trader(&pool, "carol", None).await;
    let dave = create_trader(&pool, "dave", Some("1004")).await;

    let mut alice_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/user-stats")
            .json_body(json!({"login": 1001}));
        then.status(200).json_body(stats_body(500.0));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/user-stats")
            .json_body(json!({"login": 1002}));
        then.status(200).json_body(stats_body(1200.0));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/user-stats")
            .json_body(json!({"login": 1004}));
        then.status(503).body("bridge offline");
    });

    let broker = Mt5Broker::try_from_env(&BrokerEnv {
        broker_api_url: server.base_url(),
        broker_api_key: None,
        broker_timeout_secs: 5,
        broker_dry_run: false,
    })
    .unwrap();
    let config = SyncConfig::default();

    let CycleOutcome::Completed { run, report } =
        run_sync_cycle(&pool, &broker, &config).await.unwrap()
    else {
        panic!("sync cycle should not be skipped");
    };

    assert_eq!(report.total, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].account_id, dave.id);
    assert_eq!(run.ranked, 2);
    alice_mock.assert();

    let board = leaderboard(&pool, None).await.unwrap();
    let standings: Vec<_> = board
        .iter()
        .map(|entry| (entry.account_id, entry.rank, entry.realized_pnl))
        .collect();
    assert_eq!(
        standings,
        vec![
            (bob.id, Some(1), Some(1200.0)),
            (alice.id, Some(2), Some(500.0)),
        ]
    );

    assert!(find_by_account(&pool, carol.id).await.unwrap().is_none());
    assert!(find_by_account(&pool, dave.id).await.unwrap().is_none());

    alice_mock.delete();
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/user-stats")
            .json_body(json!({"login": 1001}));
        then.status(200).json_body(stats_body(2000.0));
    });

    run_sync_cycle(&pool, &broker, &config).await.unwrap();

    let board = leaderboard(&pool, None).await.unwrap();
    assert_eq!(board[0].account_id, alice.id);
    assert_eq!(board[0].rank, Some(1));
    assert_eq!(board[1].account_id, bob.id);
    assert_eq!(board[1].rank, Some(2));

    let alice_snapshot = find_by_account(&pool, alice.id).await.unwrap().unwrap();
    assert_eq!(alice_snapshot.realized_pnl, Some(2000.0));
    assert_eq!(alice_snapshot.equity, Some(12_000.0));

    let runs = list_sync_runs(&pool, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
}
