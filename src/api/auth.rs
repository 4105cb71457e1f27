use rocket::http::Status;
use rocket::outcome::try_outcome;
use rocket::request::{FromRequest, Outcome, Request};
use sqlx::SqlitePool;
use tracing::error;

use super::{ApiError, AppState};
use crate::admins::{self, Admin};
use crate::error::{AuthError, LeagueError, WebhookError};
use crate::webhook::{ID_HEADER, SIGNATURE_HEADER, SignedHeaders, TIMESTAMP_HEADER};

/// Message of a guard rejection, cached on the request for the catcher.
struct GuardFailure(Option<String>);

pub(super) fn guard_failure(request: &Request<'_>) -> Option<String> {
    request.local_cache(|| GuardFailure(None)).0.clone()
}

fn reject<T>(request: &Request<'_>, err: LeagueError) -> Outcome<T, ApiError> {
    let err = ApiError::from(err);
    let message = err.message().to_string();
    request.local_cache(|| GuardFailure(Some(message)));
    Outcome::Error((err.status(), err))
}

fn bearer_token<'r>(request: &'r Request<'_>) -> Option<&'r str> {
    request
        .headers()
        .get_one("Authorization")?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// An admin authenticated by a live session token.
#[derive(Debug)]
pub struct AdminGuard {
    pub admin: Admin,
    pub token: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminGuard {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(token) = bearer_token(request) else {
            return reject(request, AuthError::NotAuthenticated.into());
        };

        let rocket = request.rocket();
        let (Some(pool), Some(state)) = (rocket.state::<SqlitePool>(), rocket.state::<AppState>())
        else {
            error!("Admin guard used without managed pool and state");
            return Outcome::Error((Status::InternalServerError, ApiError::internal()));
        };

        match admins::authenticate(pool, token, state.sync_config.admin_session_timeout).await {
            Ok(admin) => Outcome::Success(Self {
                admin,
                token: token.to_string(),
            }),
            Err(e) => reject(request, e),
        }
    }
}

/// An authenticated admin holding the super admin role.
#[derive(Debug)]
pub struct SuperAdminGuard(pub Admin);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SuperAdminGuard {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let guard = try_outcome!(request.guard::<AdminGuard>().await);

        match guard.admin.require_super_admin() {
            Ok(()) => Outcome::Success(Self(guard.admin)),
            Err(e) => reject(request, e.into()),
        }
    }
}

/// The signature headers of an identity provider webhook delivery.
#[derive(Debug)]
pub struct SvixHeaders {
    id: String,
    timestamp: String,
    signature: String,
}

impl SvixHeaders {
    pub fn signed(&self) -> SignedHeaders<'_> {
        SignedHeaders {
            id: &self.id,
            timestamp: &self.timestamp,
            signature: &self.signature,
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SvixHeaders {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let header = |name: &'static str| {
            request
                .headers()
                .get_one(name)
                .map(str::to_string)
                .ok_or(WebhookError::MissingHeader(name))
        };

        match (header(ID_HEADER), header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER)) {
            (Ok(id), Ok(timestamp), Ok(signature)) => Outcome::Success(Self {
                id,
                timestamp,
                signature,
            }),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => reject(request, e.into()),
        }
    }
}
