use chrono::Utc;
use rocket::data::{Data, ToByteUnit};
use rocket::serde::json::Json;
use rocket::{Route, State, post, routes};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::auth::SvixHeaders;
use super::{ApiError, ApiResult, AppState};
use crate::error::WebhookError;
use crate::payments::{self, WebhookOutcome};
use crate::webhook::{IdentityEvent, IdentityOutcome, handle_identity_event};

const MAX_WEBHOOK_BODY_MIB: u8 = 1;

/// Identity provider events. The signature covers the exact request bytes,
/// so the body is read raw and only parsed after verification.
#[post("/webhooks/identity", data = "<body>")]
async fn identity_webhook(
    headers: SvixHeaders,
    body: Data<'_>,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<IdentityOutcome> {
    let body = body
        .open(MAX_WEBHOOK_BODY_MIB.mebibytes())
        .into_bytes()
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read webhook body: {e}")))?;

    if !body.is_complete() {
        return Err(ApiError::bad_request("webhook body too large"));
    }

    let body = body.into_inner();

    if let Err(e) = state.verifier.verify(&headers.signed(), &body, Utc::now()) {
        warn!("Rejected identity webhook: {e}");
        return Err(e.into());
    }

    let event: IdentityEvent = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    info!("Received identity webhook {}", event.event_type);

    Ok(Json(handle_identity_event(pool, &event).await?))
}

#[post("/webhooks/payment", format = "json", data = "<payload>")]
async fn payment_webhook(
    payload: Json<Value>,
    pool: &State<SqlitePool>,
    state: &State<AppState>,
) -> ApiResult<WebhookOutcome> {
    let outcome =
        payments::handle_status_webhook(pool, state.broker.as_ref(), &state.cipher, &payload)
            .await?;

    Ok(Json(outcome))
}

pub(super) fn routes() -> Vec<Route> {
    routes![identity_webhook, payment_webhook]
}
