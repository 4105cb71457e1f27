use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::{Route, State, get, routes};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::ApiResult;
use crate::leagues;
use crate::snapshots::{self, LeaderboardEntry, Snapshot};

#[derive(Debug, Serialize, Deserialize)]
pub struct LastRankedResponse {
    pub last_ranked_at: Option<DateTime<Utc>>,
}

#[get("/leaderboard?<league_id>")]
async fn leaderboard(
    league_id: Option<i64>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    if let Some(league_id) = league_id {
        leagues::get_league(pool, league_id).await?;
    }

    Ok(Json(snapshots::leaderboard(pool, league_id).await?))
}

#[get("/snapshots")]
async fn list_snapshots(pool: &State<SqlitePool>) -> ApiResult<Vec<Snapshot>> {
    Ok(Json(snapshots::list_snapshots_by_rank(pool).await?))
}

#[get("/snapshots/account/<account_id>")]
async fn snapshot_for_account(account_id: i64, pool: &State<SqlitePool>) -> ApiResult<Snapshot> {
    Ok(Json(snapshots::get_by_account(pool, account_id).await?))
}

#[get("/snapshots/last-ranked")]
async fn last_ranked(pool: &State<SqlitePool>) -> ApiResult<LastRankedResponse> {
    Ok(Json(LastRankedResponse {
        last_ranked_at: snapshots::last_ranked_at(pool).await?,
    }))
}

pub(super) fn routes() -> Vec<Route> {
    routes![leaderboard, list_snapshots, snapshot_for_account, last_ranked]
}

#[cfg(test)]
mod tests {
    use league_broker::TestBroker;
    use rocket::http::Status;

    use super::*;
    use crate::api::ErrorBody;
    use crate::api::tests::test_client;
    use crate::ranking::update_rankings;
    use crate::test_utils::{
        create_test_account, create_test_league, create_test_user, insert_snapshot_with_pnl,
        setup_test_db,
    };

    #[tokio::test]
    async fn test_leaderboard_orders_by_rank() {
        let pool = setup_test_db().await;
        let league = create_test_league(&pool, "Weekly").await;

        let alice = create_test_user(&pool, "alice").await;
        let bob = create_test_user(&pool, "bob").await;
        let alice_account =
            create_test_account(&pool, alice.id, Some(league.id), Some("1001")).await;
        let bob_account = create_test_account(&pool, bob.id, Some(league.id), Some("1002")).await;
        insert_snapshot_with_pnl(&pool, alice_account.id, Some(500.0)).await;
        insert_snapshot_with_pnl(&pool, bob_account.id, Some(1200.0)).await;
        update_rankings(&pool).await.unwrap();

        let client = test_client(pool, TestBroker::new()).await;
        let response = client
            .get(format!("/leaderboard?league_id={}", league.id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let entries: Vec<LeaderboardEntry> = response.into_json().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, ["bob Tester", "alice Tester"]);
        assert_eq!(entries[0].rank, Some(1));
        assert_eq!(entries[1].rank, Some(2));
    }

    #[tokio::test]
    async fn test_leaderboard_unknown_league() {
        let pool = setup_test_db().await;
        let client = test_client(pool, TestBroker::new()).await;

        let response = client.get("/leaderboard?league_id=77").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);

        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.error, "League 77 not found");
    }

    #[tokio::test]
    async fn test_snapshot_endpoints() {
        let pool = setup_test_db().await;
        let user = create_test_user(&pool, "carol").await;
        let account = create_test_account(&pool, user.id, None, Some("2001")).await;
        insert_snapshot_with_pnl(&pool, account.id, Some(42.0)).await;

        let client = test_client(pool.clone(), TestBroker::new()).await;

        let response = client.get("/snapshots/last-ranked").dispatch().await;
        let body: LastRankedResponse = response.into_json().await.unwrap();
        assert!(body.last_ranked_at.is_none());

        update_rankings(&pool).await.unwrap();

        let response = client
            .get(format!("/snapshots/account/{}", account.id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let snapshot: Snapshot = response.into_json().await.unwrap();
        assert_eq!(snapshot.account_id, account.id);
        assert_eq!(snapshot.rank, Some(1));

        let response = client.get("/snapshots").dispatch().await;
        let all: Vec<Snapshot> = response.into_json().await.unwrap();
        assert_eq!(all.len(), 1);

        let response = client.get("/snapshots/last-ranked").dispatch().await;
        let body: LastRankedResponse = response.into_json().await.unwrap();
        assert!(body.last_ranked_at.is_some());

        let response = client.get("/snapshots/account/999").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }
}
