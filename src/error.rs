//! Domain-specific error types, one enum per concern, unified in
//! [`LeagueError`] for callers that cross module boundaries.

use league_broker::BrokerError;

/// Database persistence and data corruption errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Invalid {column} value in database: {value}")]
    InvalidEnumValue { column: &'static str, value: String },
    #[error("Invalid JSON in column {column}: {source}")]
    InvalidJson {
        column: &'static str,
        source: serde_json::Error,
    },
    #[error("Invalid decimal in database: {0}")]
    InvalidDecimal(String),
    #[error("Record missing ID after database save")]
    MissingId,
}

/// Authentication and authorization failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Session expired")]
    SessionExpired,
    #[error("Forbidden")]
    Forbidden,
    #[error("User not found")]
    UserNotFound,
}

/// Secret encryption failures.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("Encryption key is not valid base64: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
    #[error("Decrypted secret is not UTF-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

/// Payment provider interaction errors.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("{action} failed with status: {status}, body: {body}")]
    RequestFailed {
        action: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("Payment provider rejected invoice for order {order_id}")]
    InvoiceRejected { order_id: String },
    #[error("League {0} has no entry fee")]
    FreeLeague(i64),
    #[error("Invalid payment configuration: {0}")]
    InvalidConfiguration(String),
}

/// Inbound webhook validation errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Missing webhook header: {0}")]
    MissingHeader(&'static str),
    #[error("Invalid webhook signature")]
    InvalidSignature,
    #[error("Webhook timestamp outside tolerance")]
    StaleTimestamp,
    #[error("Invalid webhook secret: {0}")]
    InvalidSecret(String),
    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LeagueError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl LeagueError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for LeagueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}
