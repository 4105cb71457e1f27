use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, Utc};
use league_broker::{Broker, BrokerError, CreateUserRequest};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::activities::{ActivityKind, Actor, record_activity};
use crate::crypto::SecretCipher;
use crate::error::{LeagueError, PersistenceError};
use crate::settings;
use crate::users::User;

const PROVISION_RETRY_DELAY: Duration = Duration::from_millis(500);
const PROVISION_MAX_RETRIES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(PersistenceError::InvalidEnumValue {
                column: "accounts.status",
                value: s.to_string(),
            }),
        }
    }
}

/// A broker trading account. The password never leaves this module
/// unencrypted except through [`reveal_credentials`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: i64,
    pub user_id: i64,
    pub league_id: Option<i64>,
    pub payment_id: Option<i64>,
    pub login: Option<String>,
    pub server: Option<String>,
    pub group_name: String,
    pub leverage: i64,
    pub deposit_cents: i64,
    pub status: AccountStatus,
    pub has_password: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    user_id: i64,
    league_id: Option<i64>,
    payment_id: Option<i64>,
    login: Option<String>,
    server: Option<String>,
    group_name: String,
    leverage: i64,
    deposit_cents: i64,
    status: String,
    has_password: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = PersistenceError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            league_id: row.league_id,
            payment_id: row.payment_id,
            login: row.login,
            server: row.server,
            group_name: row.group_name,
            leverage: row.leverage,
            deposit_cents: row.deposit_cents,
            status: row.status.parse()?,
            has_password: row.has_password,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "id, user_id, league_id, payment_id, login, server, group_name, \
                               leverage, deposit_cents, status, \
                               password_encrypted IS NOT NULL AS has_password, \
                               created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub user_id: i64,
    pub league_id: Option<i64>,
    pub payment_id: Option<i64>,
    pub login: Option<String>,
    pub password_encrypted: Option<Vec<u8>>,
    pub server: Option<String>,
    pub group_name: String,
    pub leverage: i64,
    pub deposit_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccountFilter {
    pub user_id: Option<i64>,
    pub league_id: Option<i64>,
    pub status: Option<AccountStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountCredentials {
    pub account_id: i64,
    pub login: String,
    pub password: String,
    pub server: Option<String>,
}

pub async fn create_account(
    pool: &SqlitePool,
    new_account: &NewAccount,
) -> Result<Account, LeagueError> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO accounts (
            user_id, league_id, payment_id, login, password_encrypted, server,
            group_name, leverage, deposit_cents, status, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', ?10, ?10)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(new_account.user_id)
    .bind(new_account.league_id)
    .bind(new_account.payment_id)
    .bind(&new_account.login)
    .bind(&new_account.password_encrypted)
    .bind(&new_account.server)
    .bind(&new_account.group_name)
    .bind(new_account.leverage)
    .bind(new_account.deposit_cents)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LeagueError::Conflict(format!(
            "an account already exists for login {:?} or payment {:?}",
            new_account.login, new_account.payment_id
        )));
    }

    get_account(pool, result.last_insert_rowid()).await
}

fn is_transient(error: &BrokerError) -> bool {
    match error {
        BrokerError::Reqwest(_) => true,
        BrokerError::RequestFailed { status, .. } => status.is_server_error(),
        _ => false,
    }
}

/// Creates a trading account at the broker for the user and stores it.
/// Provisioning for a payment that already has an account returns that
/// account without calling the broker again.
pub async fn provision_account(
    pool: &SqlitePool,
    broker: &dyn Broker,
    cipher: &SecretCipher,
    user: &User,
    league_id: Option<i64>,
    payment_id: Option<i64>,
) -> Result<Account, LeagueError> {
    if let Some(payment_id) = payment_id {
        if let Some(existing) = find_by_payment(pool, payment_id).await? {
            info!(
                "Payment {payment_id} already has account {}, skipping provisioning",
                existing.id
            );
            return Ok(existing);
        }
    }

    let defaults = settings::account_defaults(pool).await?;
    #[allow(clippy::cast_precision_loss)]
    let request = CreateUserRequest {
        name: user.display_name(),
        email: user.email.clone(),
        group: defaults.group.clone(),
        leverage: defaults.leverage,
        deposit: defaults.deposit_cents as f64 / 100.0,
    };

    let response = (|| async { broker.create_user(&request).await })
        .retry(
            ConstantBuilder::default()
                .with_delay(PROVISION_RETRY_DELAY)
                .with_max_times(PROVISION_MAX_RETRIES),
        )
        .when(is_transient)
        .notify(|error, delay| {
            warn!(
                "Broker account creation for user {} failed, retrying in {delay:?}: {error}",
                user.id
            );
        })
        .await?;

    let password_encrypted = response
        .password
        .as_deref()
        .map(|password| cipher.encrypt(password))
        .transpose()?;

    let account = create_account(
        pool,
        &NewAccount {
            user_id: user.id,
            league_id,
            payment_id,
            login: Some(response.login.as_str().to_string()),
            password_encrypted,
            server: response.server.clone(),
            group_name: defaults.group,
            leverage: i64::from(defaults.leverage),
            deposit_cents: defaults.deposit_cents,
        },
    )
    .await?;

    record_activity(
        pool,
        ActivityKind::AccountProvisioned,
        &format!(
            "Provisioned {} account {} for {}",
            broker.to_supported_broker(),
            response.login.as_str(),
            user.email
        ),
        Actor::user(user.id),
    )
    .await?;

    info!(
        "Provisioned account {} (login {}) for user {}",
        account.id,
        response.login.as_str(),
        user.id
    );

    Ok(account)
}

pub async fn find_account(pool: &SqlitePool, id: i64) -> Result<Option<Account>, PersistenceError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Account::try_from).transpose()
}

pub async fn get_account(pool: &SqlitePool, id: i64) -> Result<Account, LeagueError> {
    find_account(pool, id)
        .await?
        .ok_or_else(|| LeagueError::not_found("Account", id))
}

pub async fn find_by_payment(
    pool: &SqlitePool,
    payment_id: i64,
) -> Result<Option<Account>, PersistenceError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE payment_id = ?1"
    ))
    .bind(payment_id)
    .fetch_optional(pool)
    .await?;

    row.map(Account::try_from).transpose()
}

pub async fn list_accounts(
    pool: &SqlitePool,
    filter: &AccountFilter,
) -> Result<Vec<Account>, PersistenceError> {
    let rows = sqlx::query_as::<_, AccountRow>(&format!(
        r#"
        SELECT {ACCOUNT_COLUMNS} FROM accounts
        WHERE (?1 IS NULL OR user_id = ?1)
          AND (?2 IS NULL OR league_id = ?2)
          AND (?3 IS NULL OR status = ?3)
        ORDER BY created_at DESC, id DESC
        "#
    ))
    .bind(filter.user_id)
    .bind(filter.league_id)
    .bind(filter.status.map(AccountStatus::as_str))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Account::try_from).collect()
}

/// Accounts the snapshot sync should fetch stats for.
pub async fn list_accounts_with_login(pool: &SqlitePool) -> Result<Vec<Account>, PersistenceError> {
    let rows = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE login IS NOT NULL AND login != '' ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Account::try_from).collect()
}

pub async fn set_account_status(
    pool: &SqlitePool,
    id: i64,
    status: AccountStatus,
) -> Result<Account, LeagueError> {
    let result = sqlx::query("UPDATE accounts SET status = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(LeagueError::not_found("Account", id));
    }

    get_account(pool, id).await
}

pub async fn assign_league(
    pool: &SqlitePool,
    id: i64,
    league_id: Option<i64>,
) -> Result<Account, LeagueError> {
    if let Some(league_id) = league_id {
        crate::leagues::get_league(pool, league_id).await?;
    }

    let result = sqlx::query("UPDATE accounts SET league_id = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(league_id)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(LeagueError::not_found("Account", id));
    }

    get_account(pool, id).await
}

pub async fn reveal_credentials(
    pool: &SqlitePool,
    cipher: &SecretCipher,
    id: i64,
) -> Result<AccountCredentials, LeagueError> {
    let row: Option<(Option<String>, Option<Vec<u8>>, Option<String>)> =
        sqlx::query_as("SELECT login, password_encrypted, server FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    let Some((login, password_encrypted, server)) = row else {
        return Err(LeagueError::not_found("Account", id));
    };

    let (Some(login), Some(password_encrypted)) = (login, password_encrypted) else {
        return Err(LeagueError::Conflict(format!(
            "account {id} has no stored credentials"
        )));
    };

    Ok(AccountCredentials {
        account_id: id,
        login,
        password: cipher.decrypt(&password_encrypted)?,
        server,
    })
}
