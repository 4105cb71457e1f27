use rocket::http::Header;
use rocket::serde::json::Json;
use rocket::{Responder, Route, State, delete, get, patch, post, put, routes};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use super::{AdminGuard, ApiError, ApiResult, AppState, SuperAdminGuard, parse_param};
use crate::accounts::{self, Account, AccountCredentials, AccountFilter, AccountStatus};
use crate::activities::{self, Activity, ActivityKind, Actor, record_activity};
use crate::admins::{self, Admin, AdminRole, AdminSession, NewAdmin};
use crate::export::{self, ExportKind};
use crate::leagues::{
    self, League, LeagueStatus, LeagueSummary, LeagueUpdate, NewLeague, Payout,
};
use crate::payments::{self, Payment, PaymentFilter, PaymentStatus};
use crate::referrals::{self, AffiliateStats, Commission, CommissionFilter, CommissionStatus};
use crate::settings::{self, Setting, SettingKey};
use crate::snapshots::Snapshot;
use crate::sync::{self, CycleOutcome, SyncRun};
use crate::users::{self, User, UserPage, UserQuery, UserStatus};
use league_broker::StatsRange;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

fn list_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

async fn audit(
    pool: &SqlitePool,
    kind: ActivityKind,
    description: &str,
    actor: Actor,
) -> Result<(), ApiError> {
    record_activity(pool, kind, description, actor).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    access_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub logged_out: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

#[derive(Debug, Deserialize)]
struct StatusChange<T> {
    status: T,
}

#[derive(Debug, Deserialize)]
struct CreateAdminRequest {
    email: String,
    name: String,
    role: AdminRole,
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    user_id: i64,
    league_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LeagueAssignment {
    league_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InvoiceRequest {
    user_id: i64,
    league_id: i64,
}

#[derive(Debug, Deserialize)]
struct SettingValue {
    value: String,
}

#[derive(Responder)]
#[response(content_type = "text/csv")]
struct CsvExport {
    body: String,
    disposition: Header<'static>,
}

// Sessions

#[post("/admin/login", format = "json", data = "<request>")]
async fn login(request: Json<LoginRequest>, pool: &State<SqlitePool>) -> ApiResult<AdminSession> {
    let session = admins::login(pool, &request.email, &request.access_key).await?;

    audit(
        pool,
        ActivityKind::AdminLogin,
        &format!("{} logged in", session.admin.email),
        Actor::admin(session.admin.id),
    )
    .await?;

    Ok(Json(session))
}

#[post("/admin/logout")]
async fn logout(guard: AdminGuard, pool: &State<SqlitePool>) -> ApiResult<LogoutResponse> {
    let logged_out = admins::logout(pool, &guard.token).await?;
    info!("Admin {} logged out", guard.admin.email);
    Ok(Json(LogoutResponse { logged_out }))
}

#[get("/admin/me")]
fn me(guard: AdminGuard) -> Json<Admin> {
    Json(guard.admin)
}

#[get("/admin/admins")]
async fn list_admins(_guard: AdminGuard, pool: &State<SqlitePool>) -> ApiResult<Vec<Admin>> {
    Ok(Json(admins::list_admins(pool).await?))
}

#[post("/admin/admins", format = "json", data = "<request>")]
async fn create_admin(
    guard: SuperAdminGuard,
    request: Json<CreateAdminRequest>,
    pool: &State<SqlitePool>,
) -> ApiResult<NewAdmin> {
    let created = admins::create_admin(pool, &request.email, &request.name, request.role).await?;
    info!(
        "Admin {} created {} {}",
        guard.0.email,
        created.admin.role.as_str(),
        created.admin.email
    );
    Ok(Json(created))
}

// Users

#[get("/admin/users?<search>&<status>&<limit>&<offset>")]
async fn list_users(
    _guard: AdminGuard,
    search: Option<String>,
    status: Option<&str>,
    limit: Option<u32>,
    offset: Option<u32>,
    pool: &State<SqlitePool>,
) -> ApiResult<UserPage> {
    let query = UserQuery {
        search,
        status: parse_param("status", status)?,
        limit,
        offset,
    };

    Ok(Json(users::list_users(pool, &query).await?))
}

#[get("/admin/users/<id>")]
async fn get_user(_guard: AdminGuard, id: i64, pool: &State<SqlitePool>) -> ApiResult<User> {
    Ok(Json(users::get_user(pool, id).await?))
}

#[put("/admin/users/<id>/status", format = "json", data = "<change>")]
async fn set_user_status(
    guard: AdminGuard,
    id: i64,
    change: Json<StatusChange<UserStatus>>,
    pool: &State<SqlitePool>,
) -> ApiResult<User> {
    let user = users::set_user_status(pool, id, change.status).await?;

    audit(
        pool,
        ActivityKind::UserStatusChanged,
        &format!("User {} set to {}", user.email, user.status.as_str()),
        Actor::admin(guard.admin.id).for_user(user.id),
    )
    .await?;

    Ok(Json(user))
}

#[get("/admin/users/<id>/affiliate")]
async fn affiliate_stats(
    _guard: AdminGuard,
    id: i64,
    pool: &State<SqlitePool>,
) -> ApiResult<AffiliateStats> {
    users::get_user(pool, id).await?;
    Ok(Json(referrals::affiliate_stats(pool, id).await?))
}

// Accounts

#[get("/admin/accounts?<user_id>&<league_id>&<status>")]
async fn list_accounts(
    _guard: AdminGuard,
    user_id: Option<i64>,
    league_id: Option<i64>,
    status: Option<&str>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<Account>> {
    let filter = AccountFilter {
        user_id,
        league_id,
        status: parse_param("status", status)?,
    };

    Ok(Json(accounts::list_accounts(pool, &filter).await?))
}

#[post("/admin/accounts", format = "json", data = "<request>")]
async fn provision_account(
    _guard: AdminGuard,
    request: Json<ProvisionRequest>,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<Account> {
    let user = users::get_user(pool, request.user_id).await?;
    if let Some(league_id) = request.league_id {
        leagues::get_league(pool, league_id).await?;
    }

    let account = accounts::provision_account(
        pool,
        state.broker.as_ref(),
        &state.cipher,
        &user,
        request.league_id,
        None,
    )
    .await?;

    Ok(Json(account))
}

#[get("/admin/accounts/<id>")]
async fn get_account(_guard: AdminGuard, id: i64, pool: &State<SqlitePool>) -> ApiResult<Account> {
    Ok(Json(accounts::get_account(pool, id).await?))
}

#[put("/admin/accounts/<id>/status", format = "json", data = "<change>")]
async fn set_account_status(
    guard: AdminGuard,
    id: i64,
    change: Json<StatusChange<AccountStatus>>,
    pool: &State<SqlitePool>,
) -> ApiResult<Account> {
    let account = accounts::set_account_status(pool, id, change.status).await?;

    audit(
        pool,
        ActivityKind::AccountStatusChanged,
        &format!("Account {} set to {}", account.id, account.status.as_str()),
        Actor::admin(guard.admin.id).for_user(account.user_id),
    )
    .await?;

    Ok(Json(account))
}

#[put("/admin/accounts/<id>/league", format = "json", data = "<assignment>")]
async fn assign_league(
    _guard: AdminGuard,
    id: i64,
    assignment: Json<LeagueAssignment>,
    pool: &State<SqlitePool>,
) -> ApiResult<Account> {
    Ok(Json(
        accounts::assign_league(pool, id, assignment.league_id).await?,
    ))
}

#[get("/admin/accounts/<id>/credentials")]
async fn account_credentials(
    guard: AdminGuard,
    id: i64,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<AccountCredentials> {
    let credentials = accounts::reveal_credentials(pool, &state.cipher, id).await?;
    info!("Admin {} revealed credentials of account {id}", guard.admin.email);
    Ok(Json(credentials))
}

/// Fetches fresh stats for one account right away. The optional body
/// narrows the statistics window.
#[post("/admin/accounts/<id>/sync", data = "<range>")]
async fn sync_account(
    _guard: AdminGuard,
    id: i64,
    range: Option<Json<StatsRange>>,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<Snapshot> {
    let range = range.map(Json::into_inner);
    let snapshot = sync::sync_account_by_id(pool, state.broker.as_ref(), id, range).await?;
    Ok(Json(snapshot))
}

// Leagues

#[get("/admin/leagues?<status>")]
async fn list_leagues(
    _guard: AdminGuard,
    status: Option<&str>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<LeagueSummary>> {
    let status: Option<LeagueStatus> = parse_param("status", status)?;
    Ok(Json(leagues::list_league_summaries(pool, status).await?))
}

#[post("/admin/leagues", format = "json", data = "<new_league>")]
async fn create_league(
    guard: AdminGuard,
    new_league: Json<NewLeague>,
    pool: &State<SqlitePool>,
) -> ApiResult<League> {
    let league = leagues::create_league(pool, &new_league, Some(guard.admin.id)).await?;

    audit(
        pool,
        ActivityKind::LeagueCreated,
        &format!("League {} created", league.name),
        Actor::admin(guard.admin.id),
    )
    .await?;

    Ok(Json(league))
}

#[get("/admin/leagues/<id>")]
async fn get_league(
    _guard: AdminGuard,
    id: i64,
    pool: &State<SqlitePool>,
) -> ApiResult<LeagueSummary> {
    Ok(Json(leagues::league_summary(pool, id).await?))
}

#[patch("/admin/leagues/<id>", format = "json", data = "<update>")]
async fn update_league(
    guard: AdminGuard,
    id: i64,
    update: Json<LeagueUpdate>,
    pool: &State<SqlitePool>,
) -> ApiResult<League> {
    let league = leagues::update_league(pool, id, &update).await?;

    audit(
        pool,
        ActivityKind::LeagueUpdated,
        &format!("League {} updated", league.name),
        Actor::admin(guard.admin.id),
    )
    .await?;

    Ok(Json(league))
}

#[put("/admin/leagues/<id>/status", format = "json", data = "<change>")]
async fn set_league_status(
    guard: AdminGuard,
    id: i64,
    change: Json<StatusChange<LeagueStatus>>,
    pool: &State<SqlitePool>,
) -> ApiResult<League> {
    let league = leagues::set_league_status(pool, id, change.status).await?;

    audit(
        pool,
        ActivityKind::LeagueUpdated,
        &format!("League {} is now {}", league.name, league.status.as_str()),
        Actor::admin(guard.admin.id),
    )
    .await?;

    Ok(Json(league))
}

#[get("/admin/leagues/<id>/payouts")]
async fn league_payouts(
    _guard: AdminGuard,
    id: i64,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<Payout>> {
    Ok(Json(leagues::payouts(pool, id).await?))
}

// Payments

#[get("/admin/payments?<user_id>&<league_id>&<status>")]
async fn list_payments(
    _guard: AdminGuard,
    user_id: Option<i64>,
    league_id: Option<i64>,
    status: Option<&str>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<Payment>> {
    let status: Option<PaymentStatus> = parse_param("status", status)?;
    let filter = PaymentFilter {
        user_id,
        league_id,
        status,
    };

    Ok(Json(payments::list_payments(pool, &filter).await?))
}

#[get("/admin/payments/<id>")]
async fn get_payment(_guard: AdminGuard, id: i64, pool: &State<SqlitePool>) -> ApiResult<Payment> {
    Ok(Json(payments::get_payment(pool, id).await?))
}

#[post("/admin/payments/invoice", format = "json", data = "<request>")]
async fn create_invoice(
    _guard: AdminGuard,
    request: Json<InvoiceRequest>,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<Payment> {
    let payment =
        payments::create_invoice(pool, &state.gateway, request.user_id, request.league_id).await?;
    Ok(Json(payment))
}

// Settings

#[get("/admin/settings")]
async fn list_settings(_guard: AdminGuard, pool: &State<SqlitePool>) -> ApiResult<Vec<Setting>> {
    Ok(Json(settings::list_settings(pool).await?))
}

#[put("/admin/settings/<key>", format = "json", data = "<setting>")]
async fn update_setting(
    guard: SuperAdminGuard,
    key: &str,
    setting: Json<SettingValue>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<Setting>> {
    let key: SettingKey = key.parse().map_err(ApiError::bad_request)?;
    settings::set_setting(pool, key, &setting.value).await?;

    audit(
        pool,
        ActivityKind::SettingChanged,
        &format!("{key} set to {}", setting.value.trim()),
        Actor::admin(guard.0.id),
    )
    .await?;

    Ok(Json(settings::list_settings(pool).await?))
}

// Referrals

#[get("/admin/commissions?<referrer_user_id>&<status>")]
async fn list_commissions(
    _guard: AdminGuard,
    referrer_user_id: Option<i64>,
    status: Option<&str>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<Commission>> {
    let status: Option<CommissionStatus> = parse_param("status", status)?;
    let filter = CommissionFilter {
        referrer_user_id,
        status,
    };

    Ok(Json(referrals::list_commissions(pool, &filter).await?))
}

#[post("/admin/commissions/<id>/pay")]
async fn pay_commission(
    guard: AdminGuard,
    id: i64,
    pool: &State<SqlitePool>,
) -> ApiResult<Commission> {
    let commission = referrals::mark_commission_paid(pool, id).await?;

    audit(
        pool,
        ActivityKind::CommissionPaid,
        &format!(
            "Commission {} of {} cents marked paid",
            commission.id, commission.amount_cents
        ),
        Actor::admin(guard.admin.id).for_user(commission.referrer_user_id),
    )
    .await?;

    Ok(Json(commission))
}

// Operations

#[get("/admin/activities?<limit>")]
async fn list_activities(
    _guard: AdminGuard,
    limit: Option<u32>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<Activity>> {
    Ok(Json(
        activities::list_recent_activities(pool, list_limit(limit)).await?,
    ))
}

#[post("/admin/sync")]
async fn trigger_sync(
    guard: AdminGuard,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<CycleOutcome> {
    info!("Admin {} triggered a snapshot sync", guard.admin.email);
    let outcome = sync::run_sync_cycle(pool, state.broker.as_ref(), &state.sync_config).await?;
    Ok(Json(outcome))
}

#[get("/admin/sync/runs?<limit>")]
async fn list_sync_runs(
    _guard: AdminGuard,
    limit: Option<u32>,
    pool: &State<SqlitePool>,
) -> ApiResult<Vec<SyncRun>> {
    Ok(Json(sync::list_sync_runs(pool, list_limit(limit)).await?))
}

#[get("/admin/export/<kind>")]
async fn export_csv(
    _guard: AdminGuard,
    kind: &str,
    pool: &State<SqlitePool>,
) -> Result<CsvExport, ApiError> {
    let kind: ExportKind = kind.parse()?;
    let body = export::export_to_string(pool, kind).await?;

    Ok(CsvExport {
        body,
        disposition: Header::new(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", kind.file_name()),
        ),
    })
}

#[delete("/admin/sessions")]
async fn purge_sessions(
    _guard: SuperAdminGuard,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<PurgeResponse> {
    let purged =
        admins::purge_idle_sessions(pool, state.sync_config.admin_session_timeout).await?;
    Ok(Json(PurgeResponse { purged }))
}

pub(super) fn routes() -> Vec<Route> {
    routes![
        login,
        logout,
        me,
        list_admins,
        create_admin,
        list_users,
        get_user,
        set_user_status,
        affiliate_stats,
        list_accounts,
        provision_account,
        get_account,
        set_account_status,
        assign_league,
        account_credentials,
        sync_account,
        list_leagues,
        create_league,
        get_league,
        update_league,
        set_league_status,
        league_payouts,
        list_payments,
        get_payment,
        create_invoice,
        list_settings,
        update_setting,
        list_commissions,
        pay_commission,
        list_activities,
        trigger_sync,
        list_sync_runs,
        export_csv,
        purge_sessions,
    ]
}

#[cfg(test)]
mod tests {
    use league_broker::TestBroker;
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;
    use serde_json::{Value, json};

    use super::*;
    use crate::api::ErrorBody;
    use crate::api::tests::{admin_header, test_client};
    use crate::test_utils::{
        create_test_account, create_test_league, create_test_user, setup_test_db,
    };

    async fn get_json(client: &Client, uri: &str, header: &Header<'static>) -> (Status, Value) {
        let response = client.get(uri.to_string()).header(header.clone()).dispatch().await;
        let status = response.status();
        (status, response.into_json().await.unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let pool = setup_test_db().await;
        let created = admins::create_admin(&pool, "ops@example.com", "Ops", AdminRole::Admin)
            .await
            .unwrap();
        let client = test_client(pool.clone(), TestBroker::new()).await;

        let response = client
            .post("/admin/login")
            .json(&json!({"email": "ops@example.com", "access_key": "wrong"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let response = client
            .post("/admin/login")
            .json(&json!({"email": "OPS@example.com", "access_key": created.access_key}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let session: Value = response.into_json().await.unwrap();
        let token = session["token"].as_str().unwrap().to_string();
        let header = Header::new("Authorization", format!("Bearer {token}"));

        let (status, me) = get_json(&client, "/admin/me", &header).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(me["email"], "ops@example.com");

        let response = client.post("/admin/logout").header(header.clone()).dispatch().await;
        let body: LogoutResponse = response.into_json().await.unwrap();
        assert!(body.logged_out);

        let (status, _) = get_json(&client, "/admin/me", &header).await;
        assert_eq!(status, Status::Unauthorized);

        let activities = activities::list_recent_activities(&pool, 10).await.unwrap();
        assert_eq!(activities[0].kind, "admin_login");
    }

    #[tokio::test]
    async fn test_super_admin_creates_admin() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "root@example.com", AdminRole::SuperAdmin).await;
        let client = test_client(pool, TestBroker::new()).await;

        let response = client
            .post("/admin/admins")
            .header(header.clone())
            .json(&json!({"email": "new@example.com", "name": "New", "role": "admin"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let created: Value = response.into_json().await.unwrap();
        assert_eq!(created["admin"]["role"], "admin");
        assert!(!created["access_key"].as_str().unwrap().is_empty());

        let response = client
            .post("/admin/admins")
            .header(header.clone())
            .json(&json!({"email": "new@example.com", "name": "Again", "role": "admin"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);

        let (_, admins) = get_json(&client, "/admin/admins", &header).await;
        assert_eq!(admins.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_user_management() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        let alice = create_test_user(&pool, "alice").await;
        create_test_user(&pool, "bob").await;
        let client = test_client(pool.clone(), TestBroker::new()).await;

        let (status, page) = get_json(&client, "/admin/users?search=alice", &header).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(page["total"], 1);
        assert_eq!(page["users"][0]["email"], "alice@example.com");

        let (status, _) = get_json(&client, "/admin/users?status=banned", &header).await;
        assert_eq!(status, Status::BadRequest);

        let response = client
            .put(format!("/admin/users/{}/status", alice.id))
            .header(header.clone())
            .json(&json!({"status": "suspended"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let user: Value = response.into_json().await.unwrap();
        assert_eq!(user["status"], "suspended");

        let (_, page) = get_json(&client, "/admin/users?status=suspended", &header).await;
        assert_eq!(page["total"], 1);

        let (status, _) = get_json(&client, "/admin/users/999", &header).await;
        assert_eq!(status, Status::NotFound);

        let (status, stats) =
            get_json(&client, &format!("/admin/users/{}/affiliate", alice.id), &header).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(stats["referrals"], 0);
    }

    #[tokio::test]
    async fn test_account_provisioning_and_credentials() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        let user = create_test_user(&pool, "trader").await;
        let league = create_test_league(&pool, "Weekly").await;
        let client = test_client(pool.clone(), TestBroker::new()).await;

        let response = client
            .post("/admin/accounts")
            .header(header.clone())
            .json(&json!({"user_id": user.id, "league_id": league.id}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let account: Value = response.into_json().await.unwrap();
        assert_eq!(account["login"], "900001");
        assert_eq!(account["has_password"], true);
        assert!(account.get("password_encrypted").is_none());
        let account_id = account["id"].as_i64().unwrap();

        let (status, credentials) = get_json(
            &client,
            &format!("/admin/accounts/{account_id}/credentials"),
            &header,
        )
        .await;
        assert_eq!(status, Status::Ok);
        assert_eq!(credentials["password"], "test-password-1");

        let response = client
            .put(format!("/admin/accounts/{account_id}/status"))
            .header(header.clone())
            .json(&json!({"status": "inactive"}))
            .dispatch()
            .await;
        let updated: Value = response.into_json().await.unwrap();
        assert_eq!(updated["status"], "inactive");

        let response = client
            .put(format!("/admin/accounts/{account_id}/league"))
            .header(header.clone())
            .json(&json!({"league_id": 404}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);

        let (_, listed) = get_json(
            &client,
            &format!("/admin/accounts?league_id={}", league.id),
            &header,
        )
        .await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_account_sync_now() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        let user = create_test_user(&pool, "trader").await;
        let account = create_test_account(&pool, user.id, None, Some("5001")).await;
        let no_login = create_test_account(&pool, user.id, None, None).await;
        let broker = TestBroker::new().with_realized_pnl("5001", 321.5);
        let client = test_client(pool, broker).await;

        let response = client
            .post(format!("/admin/accounts/{}/sync", account.id))
            .header(header.clone())
            .header(ContentType::JSON)
            .body(r#"{"from": "2030-01-07T00:00:00Z"}"#)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let snapshot: Snapshot = response.into_json().await.unwrap();
        assert_eq!(snapshot.realized_pnl, Some(321.5));
        assert_eq!(snapshot.rank, None);

        let response = client
            .post(format!("/admin/accounts/{}/sync", no_login.id))
            .header(header)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn test_league_lifecycle() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        let client = test_client(pool.clone(), TestBroker::new()).await;

        let response = client
            .post("/admin/leagues")
            .header(header.clone())
            .json(&json!({
                "name": "Spring Cup",
                "start_at": "2030-03-04T00:00:00Z",
                "end_at": "2030-03-11T00:00:00Z",
                "entry_fee_cents": 2500,
                "reward_cents": 50000,
                "prize_distribution": ["60", "40"]
            }))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let league: Value = response.into_json().await.unwrap();
        let id = league["id"].as_i64().unwrap();
        assert_eq!(league["status"], "scheduled");

        let response = client
            .post("/admin/leagues")
            .header(header.clone())
            .json(&json!({
                "name": "Greedy",
                "entry_fee_cents": 0,
                "reward_cents": 0,
                "prize_distribution": ["80", "40"]
            }))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .patch(format!("/admin/leagues/{id}"))
            .header(header.clone())
            .json(&json!({"reward_cents": 75000}))
            .dispatch()
            .await;
        let updated: Value = response.into_json().await.unwrap();
        assert_eq!(updated["reward_cents"], 75000);

        let response = client
            .put(format!("/admin/leagues/{id}/status"))
            .header(header.clone())
            .json(&json!({"status": "completed"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);

        for status in ["active", "completed"] {
            let response = client
                .put(format!("/admin/leagues/{id}/status"))
                .header(header.clone())
                .json(&json!({"status": status}))
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Ok);
        }

        let (status, summary) = get_json(&client, &format!("/admin/leagues/{id}"), &header).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["participant_pool"], 0);
        assert_eq!(summary["calculated_prize_pool_cents"], 75000);

        let (_, listed) = get_json(&client, "/admin/leagues?status=completed", &header).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, payouts) =
            get_json(&client, &format!("/admin/leagues/{id}/payouts"), &header).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(payouts, json!([]));

        let kinds: Vec<_> = activities::list_recent_activities(&pool, 20)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert!(kinds.contains(&"league_created".to_string()));
        assert!(kinds.contains(&"league_updated".to_string()));
    }

    #[tokio::test]
    async fn test_settings_require_super_admin() {
        let pool = setup_test_db().await;
        let admin = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        let root = admin_header(&pool, "root@example.com", AdminRole::SuperAdmin).await;
        let client = test_client(pool.clone(), TestBroker::new()).await;

        let (status, listed) = get_json(&client, "/admin/settings", &admin).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(listed.as_array().unwrap().len(), SettingKey::ALL.len());

        let response = client
            .put("/admin/settings/commission_rate_percent")
            .header(admin)
            .json(&json!({"value": "15"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .put("/admin/settings/commission_rate_percent")
            .header(root.clone())
            .json(&json!({"value": "15"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(
            settings::commission_rate_percent(&pool).await.unwrap().to_string(),
            "15"
        );

        let response = client
            .put("/admin/settings/commission_rate_percent")
            .header(root.clone())
            .json(&json!({"value": "250"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .put("/admin/settings/unknown_key")
            .header(root)
            .json(&json!({"value": "1"}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
        let error: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(error.error, "Unknown setting: unknown_key");
    }

    #[tokio::test]
    async fn test_sync_trigger_and_runs() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        let user = create_test_user(&pool, "trader").await;
        create_test_account(&pool, user.id, None, Some("7001")).await;
        let broker = TestBroker::new().with_realized_pnl("7001", 99.0);
        let client = test_client(pool, broker).await;

        let response = client.post("/admin/sync").header(header.clone()).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let outcome: Value = response.into_json().await.unwrap();
        assert_eq!(outcome["outcome"], "completed");
        assert_eq!(outcome["report"]["synced"], 1);

        let (_, runs) = get_json(&client, "/admin/sync/runs?limit=5", &header).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["ranked"], 1);

        let (_, activities) = get_json(&client, "/admin/activities", &header).await;
        assert!(
            activities
                .as_array()
                .unwrap()
                .iter()
                .any(|a| a["kind"] == "snapshot_sync")
        );
    }

    #[tokio::test]
    async fn test_csv_export() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        create_test_user(&pool, "alice").await;
        let client = test_client(pool, TestBroker::new()).await;

        let response = client
            .get("/admin/export/users")
            .header(header.clone())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.content_type(), Some(ContentType::CSV));
        assert_eq!(
            response.headers().get_one("Content-Disposition"),
            Some("attachment; filename=\"users.csv\"")
        );
        let body = response.into_string().await.unwrap();
        assert!(body.starts_with("id,external_id,email"));
        assert!(body.contains("alice@example.com"));

        let response = client
            .get("/admin/export/accounts")
            .header(header)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn test_invoice_for_free_league_is_rejected() {
        let pool = setup_test_db().await;
        let header = admin_header(&pool, "ops@example.com", AdminRole::Admin).await;
        let user = create_test_user(&pool, "payer").await;
        let league = leagues::create_league(
            &pool,
            &NewLeague {
                name: "Free Roll".to_string(),
                ..NewLeague::default()
            },
            None,
        )
        .await
        .unwrap();
        let client = test_client(pool, TestBroker::new()).await;

        let response = client
            .post("/admin/payments/invoice")
            .header(header.clone())
            .json(&json!({"user_id": user.id, "league_id": league.id}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let (status, payments) = get_json(&client, "/admin/payments", &header).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(payments, json!([]));
    }
}
