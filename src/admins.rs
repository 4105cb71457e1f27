//! Admin accounts and their console sessions.
//!
//! Sessions are bearer tokens with an inactivity timeout: every
//! authenticated request refreshes `last_seen_at`, and a session idle for
//! longer than the timeout is deleted on its next use.

use base64::prelude::*;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::error::{AuthError, LeagueError, PersistenceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    Admin,
    SuperAdmin,
}

impl AdminRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }
}

impl FromStr for AdminRole {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "super_admin" => Ok(Self::SuperAdmin),
            _ => Err(PersistenceError::InvalidEnumValue {
                column: "admins.role",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admin {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: AdminRole,
    pub created_at: DateTime<Utc>,
}

impl Admin {
    pub fn require_super_admin(&self) -> Result<(), AuthError> {
        match self.role {
            AdminRole::SuperAdmin => Ok(()),
            AdminRole::Admin => Err(AuthError::Forbidden),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AdminRow {
    id: i64,
    email: String,
    name: String,
    role: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AdminRow> for Admin {
    type Error = PersistenceError;

    fn try_from(row: AdminRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            email: row.email,
            name: row.name,
            role: row.role.parse()?,
            created_at: row.created_at,
        })
    }
}

/// A freshly created admin together with the only copy of their access key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewAdmin {
    pub admin: Admin,
    pub access_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminSession {
    pub token: String,
    pub admin: Admin,
}

fn random_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_access_key(access_key: &str) -> String {
    BASE64_STANDARD.encode(Sha256::digest(access_key.as_bytes()))
}

fn access_key_matches(stored_hash: &str, access_key: &str) -> bool {
    stored_hash
        .as_bytes()
        .ct_eq(hash_access_key(access_key).as_bytes())
        .into()
}

pub async fn create_admin(
    pool: &SqlitePool,
    email: &str,
    name: &str,
    role: AdminRole,
) -> Result<NewAdmin, LeagueError> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(LeagueError::Validation(format!("invalid email: {email}")));
    }

    let access_key = random_token();

    let result = sqlx::query(
        r#"
        INSERT INTO admins (email, name, role, access_key_hash, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(email) DO NOTHING
        "#,
    )
    .bind(&email)
    .bind(name.trim())
    .bind(role.as_str())
    .bind(hash_access_key(&access_key))
    .bind(Utc::now())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LeagueError::Conflict(format!("admin {email} already exists")));
    }

    info!("Created {} {email}", role.as_str());

    let admin = get_admin(pool, result.last_insert_rowid()).await?;
    Ok(NewAdmin { admin, access_key })
}

pub async fn get_admin(pool: &SqlitePool, id: i64) -> Result<Admin, LeagueError> {
    let row = sqlx::query_as::<_, AdminRow>(
        "SELECT id, email, name, role, created_at FROM admins WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| LeagueError::not_found("Admin", id))?;

    Ok(Admin::try_from(row)?)
}

pub async fn list_admins(pool: &SqlitePool) -> Result<Vec<Admin>, PersistenceError> {
    let rows = sqlx::query_as::<_, AdminRow>(
        "SELECT id, email, name, role, created_at FROM admins ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Admin::try_from).collect()
}

pub async fn login(
    pool: &SqlitePool,
    email: &str,
    access_key: &str,
) -> Result<AdminSession, LeagueError> {
    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT id, access_key_hash FROM admins WHERE email = ?1")
            .bind(email.trim().to_lowercase())
            .fetch_optional(pool)
            .await?;

    let Some((admin_id, stored_hash)) = row else {
        return Err(AuthError::NotAuthenticated.into());
    };

    if !access_key_matches(&stored_hash, access_key) {
        return Err(AuthError::NotAuthenticated.into());
    }

    let token = random_token();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO admin_sessions (token, admin_id, created_at, last_seen_at)
        VALUES (?1, ?2, ?3, ?3)
        "#,
    )
    .bind(&token)
    .bind(admin_id)
    .bind(now)
    .execute(pool)
    .await?;

    let admin = get_admin(pool, admin_id).await?;
    info!("Admin {} logged in", admin.email);

    Ok(AdminSession { token, admin })
}

/// Resolves a bearer token to its admin, enforcing the inactivity timeout.
pub async fn authenticate(
    pool: &SqlitePool,
    token: &str,
    idle_timeout: Duration,
) -> Result<Admin, LeagueError> {
    let session: Option<(i64, DateTime<Utc>)> =
        sqlx::query_as("SELECT admin_id, last_seen_at FROM admin_sessions WHERE token = ?1")
            .bind(token)
            .fetch_optional(pool)
            .await?;

    let Some((admin_id, last_seen_at)) = session else {
        return Err(AuthError::NotAuthenticated.into());
    };

    let now = Utc::now();

    if now - last_seen_at > idle_timeout {
        debug!("Session for admin {admin_id} idle since {last_seen_at}, expiring");
        logout(pool, token).await?;
        return Err(AuthError::SessionExpired.into());
    }

    sqlx::query("UPDATE admin_sessions SET last_seen_at = ?1 WHERE token = ?2")
        .bind(now)
        .bind(token)
        .execute(pool)
        .await?;

    get_admin(pool, admin_id).await
}

pub async fn logout(pool: &SqlitePool, token: &str) -> Result<bool, PersistenceError> {
    let result = sqlx::query("DELETE FROM admin_sessions WHERE token = ?1")
        .bind(token)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn purge_idle_sessions(
    pool: &SqlitePool,
    idle_timeout: Duration,
) -> Result<u64, PersistenceError> {
    let cutoff = Utc::now() - idle_timeout;

    let result = sqlx::query("DELETE FROM admin_sessions WHERE last_seen_at < ?1")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_db;

    #[test]
    fn test_access_key_matches_only_its_digest() {
        let stored = hash_access_key("correct horse");
        assert!(access_key_matches(&stored, "correct horse"));
        assert!(!access_key_matches(&stored, "correct horsE"));
        assert!(!access_key_matches(&stored, ""));
        assert!(!access_key_matches("", "correct horse"));
    }

    #[tokio::test]
    async fn test_create_admin_and_login() {
        let pool = setup_test_db().await;

        let created = create_admin(&pool, " Ops@Example.com ", "Ops", AdminRole::Admin)
            .await
            .unwrap();
        assert_eq!(created.admin.email, "ops@example.com");
        assert!(!created.access_key.is_empty());

        let session = login(&pool, "ops@example.com", &created.access_key)
            .await
            .unwrap();
        assert_eq!(session.admin.id, created.admin.id);

        let admin = authenticate(&pool, &session.token, Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(admin.email, "ops@example.com");
    }

    #[tokio::test]
    async fn test_duplicate_admin_conflict() {
        let pool = setup_test_db().await;
        create_admin(&pool, "a@example.com", "A", AdminRole::Admin)
            .await
            .unwrap();

        let error = create_admin(&pool, "A@example.com", "A2", AdminRole::SuperAdmin)
            .await
            .unwrap_err();
        assert!(matches!(error, LeagueError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let pool = setup_test_db().await;
        create_admin(&pool, "a@example.com", "A", AdminRole::Admin)
            .await
            .unwrap();

        for (email, key) in [("a@example.com", "wrong"), ("missing@example.com", "x")] {
            let error = login(&pool, email, key).await.unwrap_err();
            assert!(matches!(
                error,
                LeagueError::Auth(AuthError::NotAuthenticated)
            ));
        }
    }

    #[tokio::test]
    async fn test_unknown_token_not_authenticated() {
        let pool = setup_test_db().await;
        let error = authenticate(&pool, "nope", Duration::minutes(30))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            LeagueError::Auth(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let pool = setup_test_db().await;
        let created = create_admin(&pool, "a@example.com", "A", AdminRole::Admin)
            .await
            .unwrap();
        let session = login(&pool, "a@example.com", &created.access_key)
            .await
            .unwrap();

        sqlx::query("UPDATE admin_sessions SET last_seen_at = ?1")
            .bind(Utc::now() - Duration::minutes(45))
            .execute(&pool)
            .await
            .unwrap();

        let error = authenticate(&pool, &session.token, Duration::minutes(30))
            .await
            .unwrap_err();
        assert!(matches!(error, LeagueError::Auth(AuthError::SessionExpired)));

        // The expired session is gone for good.
        let error = authenticate(&pool, &session.token, Duration::minutes(30))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            LeagueError::Auth(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_logout_and_purge() {
        let pool = setup_test_db().await;
        let created = create_admin(&pool, "a@example.com", "A", AdminRole::Admin)
            .await
            .unwrap();
        let first = login(&pool, "a@example.com", &created.access_key)
            .await
            .unwrap();
        login(&pool, "a@example.com", &created.access_key)
            .await
            .unwrap();

        assert!(logout(&pool, &first.token).await.unwrap());
        assert!(!logout(&pool, &first.token).await.unwrap());

        sqlx::query("UPDATE admin_sessions SET last_seen_at = ?1")
            .bind(Utc::now() - Duration::hours(2))
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(purge_idle_sessions(&pool, Duration::minutes(30)).await.unwrap(), 1);
    }

    #[test]
    fn test_require_super_admin() {
        let mut admin = Admin {
            id: 1,
            email: "a@example.com".to_string(),
            name: "A".to_string(),
            role: AdminRole::Admin,
            created_at: Utc::now(),
        };
        assert!(matches!(admin.require_super_admin(), Err(AuthError::Forbidden)));

        admin.role = AdminRole::SuperAdmin;
        assert!(admin.require_super_admin().is_ok());
    }

    #[tokio::test]
    async fn test_list_admins() {
        let pool = setup_test_db().await;
        create_admin(&pool, "a@example.com", "A", AdminRole::Admin)
            .await
            .unwrap();
        create_admin(&pool, "b@example.com", "B", AdminRole::SuperAdmin)
            .await
            .unwrap();

        let admins = list_admins(&pool).await.unwrap();
        assert_eq!(admins.len(), 2);
        assert_eq!(admins[1].role, AdminRole::SuperAdmin);
    }
}
