//! HTTP surface of the league backend.
//!
//! Public read endpoints and provider webhooks are unauthenticated (webhooks
//! carry their own verification), everything under `/admin` requires a
//! bearer session token obtained from `POST /admin/login`.

mod admin;
mod auth;
mod public;
mod webhooks;

use chrono::{DateTime, Utc};
use league_broker::DynBroker;
use rocket::http::Status;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{Build, Catcher, Request, Rocket, Route, catch, catchers, get, routes};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, error};

use crate::crypto::SecretCipher;
use crate::env::Env;
use crate::error::{AuthError, LeagueError, PaymentError, PersistenceError, WebhookError};
use crate::payments::PaymentGateway;
use crate::sync::SyncConfig;
use crate::webhook::WebhookVerifier;

pub use auth::{AdminGuard, SuperAdminGuard};

/// Services shared by all request handlers, managed by rocket next to the
/// `SqlitePool`.
#[derive(Debug)]
pub struct AppState {
    pub broker: DynBroker,
    pub cipher: SecretCipher,
    pub gateway: PaymentGateway,
    pub verifier: WebhookVerifier,
    pub sync_config: SyncConfig,
}

impl AppState {
    pub fn from_env(env: &Env) -> Result<Self, LeagueError> {
        Ok(Self {
            broker: env.get_broker()?,
            cipher: env.get_cipher()?,
            gateway: env.get_payment_gateway()?,
            verifier: env.get_webhook_verifier()?,
            sync_config: env.get_sync_config(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// A failed request: HTTP status plus a JSON `{"error": "..."}` body.
#[derive(Debug)]
pub struct ApiError {
    status: Status,
    message: String,
}

impl ApiError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: Status::BadRequest,
            message: message.into(),
        }
    }

    pub(crate) fn internal() -> Self {
        Self {
            status: Status::InternalServerError,
            message: "Internal server error".to_string(),
        }
    }

    pub const fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<LeagueError> for ApiError {
    fn from(err: LeagueError) -> Self {
        let status = match &err {
            LeagueError::Auth(AuthError::Forbidden) => Status::Forbidden,
            LeagueError::Auth(AuthError::UserNotFound) | LeagueError::NotFound { .. } => {
                Status::NotFound
            }
            LeagueError::Auth(_) => Status::Unauthorized,
            LeagueError::Validation(_)
            | LeagueError::Webhook(_)
            | LeagueError::Payment(PaymentError::FreeLeague(_)) => Status::BadRequest,
            LeagueError::Conflict(_) => Status::Conflict,
            LeagueError::Broker(_) | LeagueError::Payment(_) => Status::BadGateway,
            LeagueError::Persistence(_) | LeagueError::Crypto(_) | LeagueError::Csv(_) => {
                Status::InternalServerError
            }
        };

        if status == Status::InternalServerError {
            error!("Request failed: {err}");
            return Self::internal();
        }

        if status.code >= 500 {
            error!("Upstream request failed: {err}");
        } else {
            debug!("Request rejected with {status}: {err}");
        }

        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        LeagueError::from(err).into()
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        LeagueError::from(err).into()
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        Response::build_from(
            Json(ErrorBody {
                error: self.message,
            })
            .respond_to(request)?,
        )
        .status(self.status)
        .ok()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Parses an optional query parameter, rejecting unknown values with 400.
pub(crate) fn parse_param<T: FromStr>(
    name: &str,
    value: Option<&str>,
) -> Result<Option<T>, ApiError> {
    value
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ApiError::bad_request(format!("invalid {name}: {raw}")))
        })
        .transpose()
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[get("/health")]
pub fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

/// Renders rocket-generated errors (failed guards, unmatched routes,
/// unparsable bodies) with the same JSON shape as handler errors.
#[catch(default)]
fn default_catcher(status: Status, request: &Request<'_>) -> (Status, Json<ErrorBody>) {
    let error = auth::guard_failure(request)
        .or_else(|| status.reason().map(str::to_string))
        .unwrap_or_else(|| "Unknown error".to_string());

    (status, Json(ErrorBody { error }))
}

pub fn routes() -> Vec<Route> {
    let mut routes = routes![health];
    routes.extend(public::routes());
    routes.extend(webhooks::routes());
    routes.extend(admin::routes());
    routes
}

pub fn catchers() -> Vec<Catcher> {
    catchers![default_catcher]
}

/// Mounts the API and its managed state onto a rocket instance.
pub fn mount(rocket: Rocket<Build>, pool: SqlitePool, state: AppState) -> Rocket<Build> {
    rocket
        .mount("/", routes())
        .register("/", catchers())
        .manage(pool)
        .manage(state)
}
