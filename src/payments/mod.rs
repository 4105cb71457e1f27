//! League entry payments.
//!
//! A payment starts `pending` when an invoice is requested and is settled
//! by the provider's status webhook. A successful payment provisions the
//! payer's trading account and credits their referrer.

mod gateway;

pub use gateway::{Invoice, InvoiceMetadata, InvoiceRequest, PaymentEnv, PaymentGateway};

use chrono::{DateTime, Utc};
use league_broker::Broker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::accounts::{self, Account};
use crate::activities::{ActivityKind, Actor, record_activity};
use crate::crypto::SecretCipher;
use crate::error::{LeagueError, PaymentError, PersistenceError, WebhookError};
use crate::leagues;
use crate::referrals;
use crate::users;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(PersistenceError::InvalidEnumValue {
                column: "payments.status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub league_id: Option<i64>,
    pub order_id: String,
    pub invoice_id: Option<String>,
    pub invoice_url: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: i64,
    user_id: i64,
    league_id: Option<i64>,
    order_id: String,
    invoice_id: Option<String>,
    invoice_url: Option<String>,
    amount_cents: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = PersistenceError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            league_id: row.league_id,
            order_id: row.order_id,
            invoice_id: row.invoice_id,
            invoice_url: row.invoice_url,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const PROVISIONING_CLAIM_TIMEOUT: chrono::Duration = chrono::Duration::minutes(10);

const PAYMENT_COLUMNS: &str = "id, user_id, league_id, order_id, invoice_id, invoice_url, \
                               amount_cents, currency, status, created_at, updated_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentFilter {
    pub user_id: Option<i64>,
    pub league_id: Option<i64>,
    pub status: Option<PaymentStatus>,
}

/// What a status webhook did to its payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Settled { payment: Payment, account: Account },
    Failed { payment: Payment },
    AlreadySettled { payment: Payment },
    Ignored { payment: Payment, status: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportedStatus {
    Paid,
    Failed,
    Other,
}

impl ReportedStatus {
    fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "success" | "paid" | "completed" | "confirmed" => Self::Paid,
            "failed" | "expired" | "cancelled" | "canceled" | "refunded" => Self::Failed,
            _ => Self::Other,
        }
    }
}

fn new_order_id() -> String {
    format!("LL-{}", Uuid::new_v4().simple())
}

pub(crate) async fn insert_pending_payment(
    pool: &SqlitePool,
    user_id: i64,
    league_id: Option<i64>,
    amount_cents: i64,
    currency: &str,
) -> Result<Payment, LeagueError> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO payments
            (user_id, league_id, order_id, amount_cents, currency, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)
        "#,
    )
    .bind(user_id)
    .bind(league_id)
    .bind(new_order_id())
    .bind(amount_cents)
    .bind(currency)
    .bind(now)
    .execute(pool)
    .await?;

    get_payment(pool, result.last_insert_rowid()).await
}

async fn set_status(
    pool: &SqlitePool,
    id: i64,
    from: &[PaymentStatus],
    to: PaymentStatus,
) -> Result<bool, PersistenceError> {
    let mut changed = false;
    for status in from {
        let result = sqlx::query(
            "UPDATE payments SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
        changed |= result.rows_affected() > 0;
    }
    Ok(changed)
}

/// Claims the right to provision the payment's account. Only one caller
/// wins; a claim older than `PROVISIONING_CLAIM_TIMEOUT` is treated as
/// abandoned and can be taken over.
async fn claim_provisioning(pool: &SqlitePool, id: i64) -> Result<bool, PersistenceError> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE payments SET provisioning_claimed_at = ?1
        WHERE id = ?2
          AND (provisioning_claimed_at IS NULL OR provisioning_claimed_at < ?3)
        "#,
    )
    .bind(now)
    .bind(id)
    .bind(now - PROVISIONING_CLAIM_TIMEOUT)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn release_provisioning(pool: &SqlitePool, id: i64) -> Result<(), PersistenceError> {
    sqlx::query("UPDATE payments SET provisioning_claimed_at = NULL WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Opens a provider invoice for the league's entry fee.
///
/// The payment row is written before the provider is called so the order id
/// exists when the webhook arrives. A rejected or failed request leaves the
/// payment `failed` and returns the provider error.
#[instrument(skip(pool, gateway))]
pub async fn create_invoice(
    pool: &SqlitePool,
    gateway: &PaymentGateway,
    user_id: i64,
    league_id: i64,
) -> Result<Payment, LeagueError> {
    let user = users::get_user(pool, user_id).await?;
    let league = leagues::get_league(pool, league_id).await?;
    leagues::ensure_accepting_entries(pool, &league).await?;

    if league.entry_fee_cents == 0 {
        return Err(PaymentError::FreeLeague(league.id).into());
    }

    let payment = insert_pending_payment(
        pool,
        user.id,
        Some(league.id),
        league.entry_fee_cents,
        gateway.currency(),
    )
    .await?;

    let request = gateway.invoice_request(
        &payment.order_id,
        payment.amount_cents,
        format!("Entry to {}", league.name),
        user.id,
        Some(league.id),
    );

    match gateway.create_invoice(&request).await {
        Ok(invoice) => {
            sqlx::query(
                r#"
                UPDATE payments SET invoice_id = ?1, invoice_url = ?2, updated_at = ?3
                WHERE id = ?4
                "#,
            )
            .bind(&invoice.invoice_id)
            .bind(&invoice.invoice_url)
            .bind(Utc::now())
            .bind(payment.id)
            .execute(pool)
            .await?;

            record_activity(
                pool,
                ActivityKind::PaymentCreated,
                &format!(
                    "Invoice {} opened for {} ({} cents, league {})",
                    payment.order_id, user.email, payment.amount_cents, league.name
                ),
                Actor::user(user.id),
            )
            .await?;

            get_payment(pool, payment.id).await
        }
        Err(e) => {
            error!("Invoice creation failed for order {}: {e}", payment.order_id);
            set_status(pool, payment.id, &[PaymentStatus::Pending], PaymentStatus::Failed).await?;
            record_activity(
                pool,
                ActivityKind::PaymentFailed,
                &format!("Invoice {} could not be created: {e}", payment.order_id),
                Actor::user(user.id),
            )
            .await?;
            Err(e.into())
        }
    }
}

fn order_id_from(payload: &Value) -> Option<&str> {
    payload
        .pointer("/metadata/order_id")
        .or_else(|| payload.get("order_id"))
        .or_else(|| payload.pointer("/data/metadata/order_id"))
        .or_else(|| payload.pointer("/data/order_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|order_id| !order_id.is_empty())
}

fn status_from(payload: &Value) -> Option<&str> {
    payload
        .get("status")
        .or_else(|| payload.pointer("/data/status"))
        .and_then(Value::as_str)
}

/// Applies a payment provider status callback.
///
/// Re-delivered callbacks are safe: a payment that is already settled with
/// an account is acknowledged without side effects, and a settled payment
/// whose provisioning failed earlier is provisioned again.
#[instrument(skip(pool, broker, cipher, payload))]
pub async fn handle_status_webhook(
    pool: &SqlitePool,
    broker: &dyn Broker,
    cipher: &SecretCipher,
    payload: &Value,
) -> Result<WebhookOutcome, LeagueError> {
    let order_id = order_id_from(payload).ok_or_else(|| {
        WebhookError::MalformedPayload("payment webhook without order id".to_string())
    })?;
    let reported = status_from(payload).ok_or_else(|| {
        WebhookError::MalformedPayload(format!("payment webhook for {order_id} without status"))
    })?;

    let payment = find_by_order_id(pool, order_id)
        .await?
        .ok_or_else(|| LeagueError::not_found("Payment", order_id))?;

    info!(
        "Payment webhook for order {order_id}: reported {reported}, stored {}",
        payment.status.as_str()
    );

    match ReportedStatus::parse(reported) {
        ReportedStatus::Paid => settle(pool, broker, cipher, payment).await,
        ReportedStatus::Failed => {
            let failed =
                set_status(pool, payment.id, &[PaymentStatus::Pending], PaymentStatus::Failed)
                    .await?;
            if failed {
                record_activity(
                    pool,
                    ActivityKind::PaymentFailed,
                    &format!("Payment {order_id} reported {reported}"),
                    Actor::user(payment.user_id),
                )
                .await?;
                let payment = get_payment(pool, payment.id).await?;
                Ok(WebhookOutcome::Failed { payment })
            } else {
                warn!(
                    "Ignoring {reported} for order {order_id}, payment is already {}",
                    payment.status.as_str()
                );
                Ok(WebhookOutcome::AlreadySettled { payment })
            }
        }
        ReportedStatus::Other => Ok(WebhookOutcome::Ignored {
            payment,
            status: reported.to_string(),
        }),
    }
}

async fn settle(
    pool: &SqlitePool,
    broker: &dyn Broker,
    cipher: &SecretCipher,
    payment: Payment,
) -> Result<WebhookOutcome, LeagueError> {
    let transitioned = set_status(
        pool,
        payment.id,
        &[PaymentStatus::Pending, PaymentStatus::Failed],
        PaymentStatus::Success,
    )
    .await?;

    if transitioned {
        record_activity(
            pool,
            ActivityKind::PaymentSucceeded,
            &format!("Payment {} succeeded ({} cents)", payment.order_id, payment.amount_cents),
            Actor::user(payment.user_id),
        )
        .await?;
    } else {
        if accounts::find_by_payment(pool, payment.id).await?.is_some() {
            return Ok(WebhookOutcome::AlreadySettled { payment });
        }
        warn!(
            "Payment {} settled earlier without an account, provisioning now",
            payment.order_id
        );
    }

    if !claim_provisioning(pool, payment.id).await? {
        info!(
            "Provisioning for payment {} is claimed by another delivery",
            payment.order_id
        );
        return Ok(WebhookOutcome::AlreadySettled { payment });
    }

    let account = match provision_for_payment(pool, broker, cipher, &payment).await {
        Ok(account) => account,
        Err(e) => {
            if let Err(release_error) = release_provisioning(pool, payment.id).await {
                error!(
                    "Failed to release provisioning claim for payment {}: {release_error}",
                    payment.order_id
                );
            }
            return Err(e);
        }
    };

    let payment = get_payment(pool, payment.id).await?;
    Ok(WebhookOutcome::Settled { payment, account })
}

async fn provision_for_payment(
    pool: &SqlitePool,
    broker: &dyn Broker,
    cipher: &SecretCipher,
    payment: &Payment,
) -> Result<Account, LeagueError> {
    referrals::record_commission(pool, payment.id, payment.user_id, payment.amount_cents).await?;

    let user = users::get_user(pool, payment.user_id).await?;
    accounts::provision_account(pool, broker, cipher, &user, payment.league_id, Some(payment.id))
        .await
}

pub async fn find_payment(pool: &SqlitePool, id: i64) -> Result<Option<Payment>, PersistenceError> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Payment::try_from).transpose()
}

pub async fn get_payment(pool: &SqlitePool, id: i64) -> Result<Payment, LeagueError> {
    find_payment(pool, id)
        .await?
        .ok_or_else(|| LeagueError::not_found("Payment", id))
}

pub async fn find_by_order_id(
    pool: &SqlitePool,
    order_id: &str,
) -> Result<Option<Payment>, PersistenceError> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = ?1"
    ))
    .bind(order_id)
    .fetch_optional(pool)
    .await?;

    row.map(Payment::try_from).transpose()
}

pub async fn list_payments(
    pool: &SqlitePool,
    filter: &PaymentFilter,
) -> Result<Vec<Payment>, PersistenceError> {
    let rows = sqlx::query_as::<_, PaymentRow>(&format!(
        r#"
        SELECT {PAYMENT_COLUMNS} FROM payments
        WHERE (?1 IS NULL OR user_id = ?1)
          AND (?2 IS NULL OR league_id = ?2)
          AND (?3 IS NULL OR status = ?3)
        ORDER BY created_at DESC, id DESC
        "#
    ))
    .bind(filter.user_id)
    .bind(filter.league_id)
    .bind(filter.status.map(PaymentStatus::as_str))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Payment::try_from).collect()
}
