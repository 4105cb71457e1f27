use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserStatusChanged,
    AccountProvisioned,
    AccountStatusChanged,
    LeagueCreated,
    LeagueUpdated,
    PaymentCreated,
    PaymentSucceeded,
    PaymentFailed,
    CommissionPaid,
    SettingChanged,
    SnapshotSync,
    AdminLogin,
}

impl ActivityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserCreated => "user_created",
            Self::UserUpdated => "user_updated",
            Self::UserDeleted => "user_deleted",
            Self::UserStatusChanged => "user_status_changed",
            Self::AccountProvisioned => "account_provisioned",
            Self::AccountStatusChanged => "account_status_changed",
            Self::LeagueCreated => "league_created",
            Self::LeagueUpdated => "league_updated",
            Self::PaymentCreated => "payment_created",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::CommissionPaid => "commission_paid",
            Self::SettingChanged => "setting_changed",
            Self::SnapshotSync => "snapshot_sync",
            Self::AdminLogin => "admin_login",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: i64,
    pub kind: String,
    pub description: String,
    pub admin_id: Option<i64>,
    pub user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Who triggered an activity. Both are optional: scheduler and webhook
/// driven activities have neither.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actor {
    pub admin_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl Actor {
    pub const SYSTEM: Self = Self {
        admin_id: None,
        user_id: None,
    };

    pub const fn admin(admin_id: i64) -> Self {
        Self {
            admin_id: Some(admin_id),
            user_id: None,
        }
    }

    pub const fn user(user_id: i64) -> Self {
        Self {
            admin_id: None,
            user_id: Some(user_id),
        }
    }

    #[must_use]
    pub const fn for_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

pub async fn record_activity(
    pool: &SqlitePool,
    kind: ActivityKind,
    description: &str,
    actor: Actor,
) -> Result<i64, PersistenceError> {
    debug!("Recording activity {}: {description}", kind.as_str());

    let result = sqlx::query(
        r#"
        INSERT INTO activities (kind, description, admin_id, user_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(kind.as_str())
    .bind(description)
    .bind(actor.admin_id)
    .bind(actor.user_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn list_recent_activities(
    pool: &SqlitePool,
    limit: u32,
) -> Result<Vec<Activity>, PersistenceError> {
    let activities = sqlx::query_as::<_, Activity>(
        r#"
        SELECT id, kind, description, admin_id, user_id, created_at
        FROM activities
        ORDER BY created_at DESC, id DESC
        LIMIT ?1
        "#,
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    Ok(activities)
}
