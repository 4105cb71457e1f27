use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{LeagueError, PersistenceError};
use crate::referrals;

const REFERRAL_CODE_LEN: usize = 8;
const MAX_REFERRAL_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
}

impl UserStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for UserStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            _ => Err(PersistenceError::InvalidEnumValue {
                column: "users.status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub external_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image_url: Option<String>,
    pub referral_code: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if name.is_empty() {
            self.email.clone()
        } else {
            name
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    external_id: String,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    image_url: Option<String>,
    referral_code: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = PersistenceError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            external_id: row.external_id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            image_url: row.image_url,
            referral_code: row.referral_code,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const USER_COLUMNS: &str = "id, external_id, email, first_name, last_name, image_url, \
                            referral_code, status, created_at, updated_at";

/// User profile as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityProfile {
    pub external_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image_url: Option<String>,
    /// Referral code the user signed up with, if any.
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub user: User,
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserQuery {
    pub search: Option<String>,
    pub status: Option<UserStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserPage {
    pub users: Vec<User>,
    pub total: i64,
}

fn generate_referral_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERRAL_CODE_LEN)
        .map(|byte| char::from(byte).to_ascii_uppercase())
        .collect()
}

pub async fn find_user(pool: &SqlitePool, id: i64) -> Result<Option<User>, PersistenceError> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(User::try_from).transpose()
}

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<User, LeagueError> {
    find_user(pool, id)
        .await?
        .ok_or_else(|| LeagueError::not_found("User", id))
}

pub async fn find_by_external_id(
    pool: &SqlitePool,
    external_id: &str,
) -> Result<Option<User>, PersistenceError> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE external_id = ?1"
    ))
    .bind(external_id)
    .fetch_optional(pool)
    .await?;

    row.map(User::try_from).transpose()
}

pub async fn find_by_referral_code(
    pool: &SqlitePool,
    referral_code: &str,
) -> Result<Option<User>, PersistenceError> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE referral_code = ?1"
    ))
    .bind(referral_code.trim().to_ascii_uppercase())
    .fetch_optional(pool)
    .await?;

    row.map(User::try_from).transpose()
}

/// Creates or refreshes a user from an identity-provider profile. New users
/// get a referral code and, when they signed up with a valid code, a
/// referral link to its owner.
pub async fn upsert_from_identity(
    pool: &SqlitePool,
    profile: &IdentityProfile,
) -> Result<UpsertOutcome, LeagueError> {
    if profile.external_id.trim().is_empty() {
        return Err(LeagueError::Validation("external id is required".to_string()));
    }

    let now = Utc::now();

    if let Some(existing) = find_by_external_id(pool, &profile.external_id).await? {
        sqlx::query(
            r#"
            UPDATE users
            SET email = ?1, first_name = ?2, last_name = ?3, image_url = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.image_url)
        .bind(now)
        .bind(existing.id)
        .execute(pool)
        .await?;

        let user = get_user(pool, existing.id).await?;
        return Ok(UpsertOutcome {
            user,
            created: false,
        });
    }

    let referrer = match profile.referral_code.as_deref() {
        Some(code) if !code.trim().is_empty() => {
            let referrer = find_by_referral_code(pool, code).await?;
            if referrer.is_none() {
                warn!("Ignoring unknown referral code {code} for {}", profile.external_id);
            }
            referrer
        }
        _ => None,
    };

    let mut sql_tx = pool.begin().await?;
    let mut user_id = None;

    for _ in 0..MAX_REFERRAL_CODE_ATTEMPTS {
        let result = sqlx::query(
            r#"
            INSERT INTO users (
                external_id, email, first_name, last_name, image_url,
                referral_code, status, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7)
            ON CONFLICT(referral_code) DO NOTHING
            "#,
        )
        .bind(&profile.external_id)
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.image_url)
        .bind(generate_referral_code())
        .bind(now)
        .execute(&mut *sql_tx)
        .await?;

        if result.rows_affected() == 1 {
            user_id = Some(result.last_insert_rowid());
            break;
        }
    }

    let user_id = user_id.ok_or_else(|| {
        LeagueError::Conflict("could not allocate a unique referral code".to_string())
    })?;

    if let Some(referrer) = &referrer {
        referrals::link_referral(&mut sql_tx, referrer.id, user_id).await?;
    }

    sql_tx.commit().await?;

    info!(
        "Created user {user_id} for {} (referred by: {:?})",
        profile.external_id,
        referrer.as_ref().map(|r| r.id)
    );

    let user = get_user(pool, user_id).await?;
    Ok(UpsertOutcome {
        user,
        created: true,
    })
}

/// Escapes `LIKE` wildcards so a search term only matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub async fn list_users(pool: &SqlitePool, query: &UserQuery) -> Result<UserPage, LeagueError> {
    const FILTER: &str = r#"
        WHERE (?1 IS NULL
               OR lower(email) LIKE ?1 ESCAPE '\'
               OR lower(coalesce(first_name, '') || ' ' || coalesce(last_name, ''))
                  LIKE ?1 ESCAPE '\')
          AND (?2 IS NULL OR status = ?2)
    "#;

    let pattern = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|search| !search.is_empty())
        .map(|search| format!("%{}%", escape_like(&search.to_lowercase())));
    let status = query.status.map(UserStatus::as_str);
    let limit = i64::from(query.limit.unwrap_or(50).min(500));
    let offset = i64::from(query.offset.unwrap_or(0));

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM users {FILTER}"))
        .bind(&pattern)
        .bind(status)
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query_as::<_, UserRow>(&format!(
        r#"
        SELECT {USER_COLUMNS} FROM users {FILTER}
        ORDER BY created_at DESC, id DESC
        LIMIT ?3 OFFSET ?4
        "#
    ))
    .bind(&pattern)
    .bind(status)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let users = rows
        .into_iter()
        .map(User::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(UserPage { users, total })
}

pub async fn set_user_status(
    pool: &SqlitePool,
    id: i64,
    status: UserStatus,
) -> Result<User, LeagueError> {
    let result = sqlx::query("UPDATE users SET status = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(LeagueError::not_found("User", id));
    }

    get_user(pool, id).await
}

/// Deletes a user and, through cascading foreign keys, their accounts,
/// snapshots, payments and referral links. Returns whether a user existed.
pub async fn delete_by_external_id(
    pool: &SqlitePool,
    external_id: &str,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query("DELETE FROM users WHERE external_id = ?1")
        .bind(external_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
