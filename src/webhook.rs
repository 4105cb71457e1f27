//! Identity provider webhooks.
//!
//! Deliveries are signed the svix way: the signed content is
//! `"{svix-id}.{svix-timestamp}.{body}"`, the HMAC-SHA256 key is the base64
//! part of a `whsec_` secret, and `svix-signature` carries one or more
//! space separated `v1,<base64>` signatures.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::activities::{ActivityKind, Actor, record_activity};
use crate::error::{LeagueError, WebhookError};
use crate::users::{self, IdentityProfile, User};

type HmacSha256 = Hmac<Sha256>;

const SECRET_PREFIX: &str = "whsec_";
const SIGNATURE_VERSION: &str = "v1";

pub const ID_HEADER: &str = "svix-id";
pub const TIMESTAMP_HEADER: &str = "svix-timestamp";
pub const SIGNATURE_HEADER: &str = "svix-signature";

/// Maximum clock skew accepted between the sender and us.
pub fn timestamp_tolerance() -> Duration {
    Duration::minutes(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier").finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn from_secret(secret: &str) -> Result<Self, WebhookError> {
        let encoded = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
        let key = BASE64
            .decode(encoded)
            .map_err(|e| WebhookError::InvalidSecret(e.to_string()))?;

        if key.is_empty() {
            return Err(WebhookError::InvalidSecret("secret is empty".to_string()));
        }

        Ok(Self { key })
    }

    fn mac(&self, id: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, WebhookError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| WebhookError::InvalidSecret(e.to_string()))?;
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// Produces the `svix-signature` header value for a delivery.
    pub fn sign(&self, id: &str, timestamp: &str, body: &[u8]) -> Result<String, WebhookError> {
        let signature = self.mac(id, timestamp, body)?.finalize().into_bytes();
        Ok(format!("{SIGNATURE_VERSION},{}", BASE64.encode(signature)))
    }

    pub fn verify(
        &self,
        headers: &SignedHeaders<'_>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let sent_at = headers
            .timestamp
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
            .ok_or(WebhookError::StaleTimestamp)?;

        if (now - sent_at).abs() > timestamp_tolerance() {
            return Err(WebhookError::StaleTimestamp);
        }

        let mac = self.mac(headers.id, headers.timestamp, body)?;

        let matched = headers
            .signature
            .split_whitespace()
            .filter_map(|candidate| candidate.split_once(','))
            .filter(|(version, _)| *version == SIGNATURE_VERSION)
            .filter_map(|(_, encoded)| BASE64.decode(encoded).ok())
            .any(|signature| mac.clone().verify_slice(&signature).is_ok());

        if matched {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IdentityOutcome {
    Upserted { user: User, created: bool },
    Deleted { external_id: String, existed: bool },
    Ignored { event_type: String },
}

fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn primary_email(data: &Value) -> Option<String> {
    let addresses = data.get("email_addresses").and_then(Value::as_array);
    let primary_id = data.get("primary_email_address_id").and_then(Value::as_str);

    let from_list = addresses.and_then(|addresses| {
        addresses
            .iter()
            .find(|address| {
                primary_id.is_some() && address.get("id").and_then(Value::as_str) == primary_id
            })
            .or_else(|| addresses.first())
            .and_then(|address| text(address, "email_address"))
    });

    from_list.or_else(|| text(data, "email"))
}

fn referral_code(data: &Value) -> Option<String> {
    ["unsafe_metadata", "public_metadata"]
        .iter()
        .filter_map(|section| data.get(*section))
        .find_map(|metadata| {
            text(metadata, "referral_code").or_else(|| text(metadata, "referralCode"))
        })
}

impl IdentityEvent {
    fn external_id(&self) -> Result<String, WebhookError> {
        text(&self.data, "id").ok_or_else(|| {
            WebhookError::MalformedPayload(format!("{} event without user id", self.event_type))
        })
    }

    pub fn profile(&self) -> Result<IdentityProfile, WebhookError> {
        let external_id = self.external_id()?;
        let email = primary_email(&self.data).ok_or_else(|| {
            WebhookError::MalformedPayload(format!("user {external_id} has no email address"))
        })?;

        Ok(IdentityProfile {
            external_id,
            email,
            first_name: text(&self.data, "first_name"),
            last_name: text(&self.data, "last_name"),
            image_url: text(&self.data, "image_url"),
            referral_code: referral_code(&self.data),
        })
    }
}

pub async fn handle_identity_event(
    pool: &SqlitePool,
    event: &IdentityEvent,
) -> Result<IdentityOutcome, LeagueError> {
    debug!("Identity webhook event: {}", event.event_type);

    match event.event_type.as_str() {
        "user.created" | "user.updated" => {
            let profile = event.profile()?;
            let outcome = users::upsert_from_identity(pool, &profile).await?;

            let kind = if outcome.created {
                ActivityKind::UserCreated
            } else {
                ActivityKind::UserUpdated
            };
            record_activity(
                pool,
                kind,
                &format!("{} via identity webhook", outcome.user.email),
                Actor::user(outcome.user.id),
            )
            .await?;

            Ok(IdentityOutcome::Upserted {
                user: outcome.user,
                created: outcome.created,
            })
        }
        "user.deleted" => {
            let external_id = event.external_id()?;
            let existed = users::delete_by_external_id(pool, &external_id).await?;

            if existed {
                record_activity(
                    pool,
                    ActivityKind::UserDeleted,
                    &format!("User {external_id} deleted via identity webhook"),
                    Actor::SYSTEM,
                )
                .await?;
                info!("Deleted user {external_id}");
            } else {
                warn!("Delete event for unknown user {external_id}");
            }

            Ok(IdentityOutcome::Deleted {
                external_id,
                existed,
            })
        }
        other => {
            debug!("Ignoring identity event type {other}");
            Ok(IdentityOutcome::Ignored {
                event_type: other.to_string(),
            })
        }
    }
}
