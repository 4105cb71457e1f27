use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::error::{LeagueError, PersistenceError};
use crate::money::percent_of_cents;
use crate::settings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Referral {
    pub id: i64,
    pub referrer_user_id: i64,
    pub referred_user_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Paid,
}

impl CommissionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }
}

impl FromStr for CommissionStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            _ => Err(PersistenceError::InvalidEnumValue {
                column: "commissions.status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub id: i64,
    pub referral_id: i64,
    pub referrer_user_id: i64,
    pub referred_user_id: i64,
    pub payment_id: i64,
    pub amount_cents: i64,
    pub rate_percent: Decimal,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct CommissionRow {
    id: i64,
    referral_id: i64,
    referrer_user_id: i64,
    referred_user_id: i64,
    payment_id: i64,
    amount_cents: i64,
    rate_percent: String,
    status: String,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

impl TryFrom<CommissionRow> for Commission {
    type Error = PersistenceError;

    fn try_from(row: CommissionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            referral_id: row.referral_id,
            referrer_user_id: row.referrer_user_id,
            referred_user_id: row.referred_user_id,
            payment_id: row.payment_id,
            amount_cents: row.amount_cents,
            rate_percent: Decimal::from_str(&row.rate_percent)
                .map_err(|_| PersistenceError::InvalidDecimal(row.rate_percent.clone()))?,
            status: row.status.parse()?,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

const COMMISSION_SELECT: &str = r#"
    SELECT c.id, c.referral_id, r.referrer_user_id, r.referred_user_id, c.payment_id,
           c.amount_cents, c.rate_percent, c.status, c.created_at, c.paid_at
    FROM commissions c
    JOIN referrals r ON r.id = c.referral_id
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommissionFilter {
    pub referrer_user_id: Option<i64>,
    pub status: Option<CommissionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffiliateStats {
    pub user_id: i64,
    pub referrals: i64,
    pub pending_cents: i64,
    pub paid_cents: i64,
}

/// Links a referred user to their referrer. A user keeps the first referrer
/// they were linked to.
pub(crate) async fn link_referral(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    referrer_user_id: i64,
    referred_user_id: i64,
) -> Result<(), LeagueError> {
    if referrer_user_id == referred_user_id {
        return Err(LeagueError::Validation(
            "users cannot refer themselves".to_string(),
        ));
    }

    sqlx::query(
        r#"
        INSERT INTO referrals (referrer_user_id, referred_user_id, created_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(referred_user_id) DO NOTHING
        "#,
    )
    .bind(referrer_user_id)
    .bind(referred_user_id)
    .bind(Utc::now())
    .execute(&mut **sql_tx)
    .await?;

    Ok(())
}

pub async fn find_referral_for(
    pool: &SqlitePool,
    referred_user_id: i64,
) -> Result<Option<Referral>, PersistenceError> {
    let referral = sqlx::query_as::<_, Referral>(
        r#"
        SELECT id, referrer_user_id, referred_user_id, created_at
        FROM referrals
        WHERE referred_user_id = ?1
        "#,
    )
    .bind(referred_user_id)
    .fetch_optional(pool)
    .await?;

    Ok(referral)
}

async fn find_commission_by_payment(
    pool: &SqlitePool,
    payment_id: i64,
) -> Result<Option<Commission>, PersistenceError> {
    let row = sqlx::query_as::<_, CommissionRow>(&format!(
        "{COMMISSION_SELECT} WHERE c.payment_id = ?1"
    ))
    .bind(payment_id)
    .fetch_optional(pool)
    .await?;

    row.map(Commission::try_from).transpose()
}

pub async fn get_commission(pool: &SqlitePool, id: i64) -> Result<Commission, LeagueError> {
    let row = sqlx::query_as::<_, CommissionRow>(&format!("{COMMISSION_SELECT} WHERE c.id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| LeagueError::not_found("Commission", id))?;

    Ok(Commission::try_from(row)?)
}

/// Records the referrer's commission for a referred user's successful
/// payment. Returns `None` when the payer was not referred. Recording is
/// idempotent per payment.
pub async fn record_commission(
    pool: &SqlitePool,
    payment_id: i64,
    payer_user_id: i64,
    amount_cents: i64,
) -> Result<Option<Commission>, LeagueError> {
    let Some(referral) = find_referral_for(pool, payer_user_id).await? else {
        return Ok(None);
    };

    let rate = settings::commission_rate_percent(pool).await?;
    let commission_cents = percent_of_cents(amount_cents, rate)?;

    sqlx::query(
        r#"
        INSERT INTO commissions
            (referral_id, payment_id, amount_cents, rate_percent, status, created_at)
        VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
        ON CONFLICT(payment_id) DO NOTHING
        "#,
    )
    .bind(referral.id)
    .bind(payment_id)
    .bind(commission_cents)
    .bind(rate.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;

    info!(
        "Recorded {commission_cents} cent commission for user {} on payment {payment_id}",
        referral.referrer_user_id
    );

    Ok(find_commission_by_payment(pool, payment_id).await?)
}

pub async fn list_commissions(
    pool: &SqlitePool,
    filter: &CommissionFilter,
) -> Result<Vec<Commission>, PersistenceError> {
    let rows = sqlx::query_as::<_, CommissionRow>(&format!(
        r#"{COMMISSION_SELECT}
        WHERE (?1 IS NULL OR r.referrer_user_id = ?1)
          AND (?2 IS NULL OR c.status = ?2)
        ORDER BY c.created_at DESC, c.id DESC"#
    ))
    .bind(filter.referrer_user_id)
    .bind(filter.status.map(CommissionStatus::as_str))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Commission::try_from).collect()
}

pub async fn mark_commission_paid(pool: &SqlitePool, id: i64) -> Result<Commission, LeagueError> {
    let result = sqlx::query(
        "UPDATE commissions SET status = 'paid', paid_at = ?1 WHERE id = ?2 AND status = 'pending'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let existing = get_commission(pool, id).await?;
        return Err(LeagueError::Conflict(format!(
            "commission {id} is already {}",
            existing.status.as_str()
        )));
    }

    get_commission(pool, id).await
}

pub async fn affiliate_stats(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<AffiliateStats, LeagueError> {
    let referrals: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM referrals WHERE referrer_user_id = ?1")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

    let (pending_cents, paid_cents): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN c.status = 'pending' THEN c.amount_cents END), 0),
            COALESCE(SUM(CASE WHEN c.status = 'paid' THEN c.amount_cents END), 0)
        FROM commissions c
        JOIN referrals r ON r.id = c.referral_id
        WHERE r.referrer_user_id = ?1
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(AffiliateStats {
        user_id,
        referrals,
        pending_cents,
        paid_cents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{SettingKey, set_setting};
    use crate::test_utils::{create_test_payment, create_test_user, setup_test_db};
    use rust_decimal_macros::dec;

    async fn refer(pool: &SqlitePool, referrer: i64, referred: i64) {
        let mut sql_tx = pool.begin().await.unwrap();
        link_referral(&mut sql_tx, referrer, referred).await.unwrap();
        sql_tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_link_referral_keeps_first_referrer() {
        let pool = setup_test_db().await;
        let first = create_test_user(&pool, "first").await;
        let second = create_test_user(&pool, "second").await;
        let referred = create_test_user(&pool, "referred").await;

        refer(&pool, first.id, referred.id).await;
        refer(&pool, second.id, referred.id).await;

        let referral = find_referral_for(&pool, referred.id).await.unwrap().unwrap();
        assert_eq!(referral.referrer_user_id, first.id);
    }

    #[tokio::test]
    async fn test_self_referral_rejected() {
        let pool = setup_test_db().await;
        let user = create_test_user(&pool, "self").await;

        let mut sql_tx = pool.begin().await.unwrap();
        let error = link_referral(&mut sql_tx, user.id, user.id).await.unwrap_err();
        assert!(matches!(error, LeagueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_record_commission_for_referred_payment() {
        let pool = setup_test_db().await;
        let referrer = create_test_user(&pool, "ref").await;
        let payer = create_test_user(&pool, "payer").await;
        refer(&pool, referrer.id, payer.id).await;
        set_setting(&pool, SettingKey::CommissionRatePercent, "12.5")
            .await
            .unwrap();

        let payment = create_test_payment(&pool, payer.id, None, 4_999).await;
        let commission = record_commission(&pool, payment.id, payer.id, 4_999)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(commission.amount_cents, 624);
        assert_eq!(commission.rate_percent, dec!(12.5));
        assert_eq!(commission.referrer_user_id, referrer.id);
        assert_eq!(commission.status, CommissionStatus::Pending);

        // Idempotent per payment.
        let again = record_commission(&pool, payment.id, payer.id, 4_999)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, commission.id);
        assert_eq!(
            list_commissions(&pool, &CommissionFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_no_commission_without_referral() {
        let pool = setup_test_db().await;
        let payer = create_test_user(&pool, "solo").await;
        let payment = create_test_payment(&pool, payer.id, None, 1_000).await;

        let commission = record_commission(&pool, payment.id, payer.id, 1_000)
            .await
            .unwrap();
        assert!(commission.is_none());
    }

    #[tokio::test]
    async fn test_mark_paid_and_affiliate_stats() {
        let pool = setup_test_db().await;
        let referrer = create_test_user(&pool, "aff").await;
        let payer_a = create_test_user(&pool, "a").await;
        let payer_b = create_test_user(&pool, "b").await;
        refer(&pool, referrer.id, payer_a.id).await;
        refer(&pool, referrer.id, payer_b.id).await;

        let payment_a = create_test_payment(&pool, payer_a.id, None, 10_000).await;
        let payment_b = create_test_payment(&pool, payer_b.id, None, 20_000).await;
        let commission_a = record_commission(&pool, payment_a.id, payer_a.id, 10_000)
            .await
            .unwrap()
            .unwrap();
        record_commission(&pool, payment_b.id, payer_b.id, 20_000)
            .await
            .unwrap();

        let paid = mark_commission_paid(&pool, commission_a.id).await.unwrap();
        assert_eq!(paid.status, CommissionStatus::Paid);
        assert!(paid.paid_at.is_some());

        let error = mark_commission_paid(&pool, commission_a.id)
            .await
            .unwrap_err();
        assert!(matches!(error, LeagueError::Conflict(_)));

        let stats = affiliate_stats(&pool, referrer.id).await.unwrap();
        assert_eq!(stats.referrals, 2);
        assert_eq!(stats.paid_cents, 1_000);
        assert_eq!(stats.pending_cents, 2_000);

        let pending = list_commissions(
            &pool,
            &CommissionFilter {
                referrer_user_id: Some(referrer.id),
                status: Some(CommissionStatus::Pending),
            },
        )
        .await
        .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payment_id, payment_b.id);
    }

    #[tokio::test]
    async fn test_mark_unknown_commission() {
        let pool = setup_test_db().await;
        let error = mark_commission_paid(&pool, 42).await.unwrap_err();
        assert!(matches!(error, LeagueError::NotFound { .. }));
    }
}
