use clap::Parser;
use league_broker::{BrokerEnv, BrokerError, DryRunBroker, DynBroker, Mt5Broker};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;

use crate::crypto::SecretCipher;
use crate::error::{CryptoError, PaymentError, WebhookError};
use crate::payments::{PaymentEnv, PaymentGateway};
use crate::sync::SyncConfig;
use crate::telemetry::{TelemetryConfig, TelemetryGuard, default_filter, setup_telemetry};
use crate::webhook::WebhookVerifier;

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env)]
    pub database_url: String,
    #[clap(long, env, default_value = "debug")]
    pub log_level: LogLevel,
    #[clap(flatten)]
    pub broker: BrokerEnv,
    #[clap(flatten)]
    pub payment: PaymentEnv,
    /// Signing secret of the identity provider webhook (`whsec_...`)
    #[clap(long, env)]
    pub identity_webhook_secret: String,
    /// Base64 encoded 32 byte key for encrypting broker passwords
    #[clap(long, env)]
    pub encryption_key: String,
    /// Minutes between scheduled snapshot syncs
    #[clap(long, env, default_value = "30")]
    pub sync_interval_minutes: u64,
    /// Maximum number of accounts synced concurrently
    #[clap(long, env, default_value = "4")]
    pub sync_concurrency: usize,
    /// Minutes after which an unreleased sync lease is considered abandoned
    #[clap(long, env, default_value = "25")]
    pub sync_lease_minutes: i64,
    /// Minutes of inactivity after which admin sessions expire
    #[clap(long, env, default_value = "30")]
    pub admin_session_timeout_minutes: i64,
    #[clap(long, env, default_value = "8080")]
    pub server_port: u16,
    /// API key for OTLP trace export (optional)
    #[clap(long, env)]
    pub otlp_api_key: Option<String>,
    #[clap(long, env, default_value = "https://in-otel.hyperdx.io/v1/traces")]
    pub otlp_endpoint: String,
    /// Service name reported with exported traces
    #[clap(long, env, default_value = "leadership-league")]
    pub service_name: String,
}

impl Env {
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&self.database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        SqlitePool::connect_with(options).await
    }

    pub fn get_broker(&self) -> Result<DynBroker, BrokerError> {
        if self.broker.broker_dry_run {
            Ok(Arc::new(DryRunBroker::new()))
        } else {
            Ok(Arc::new(Mt5Broker::try_from_env(&self.broker)?))
        }
    }

    pub fn get_payment_gateway(&self) -> Result<PaymentGateway, PaymentError> {
        PaymentGateway::try_from_env(&self.payment)
    }

    pub fn get_cipher(&self) -> Result<SecretCipher, CryptoError> {
        SecretCipher::from_base64(&self.encryption_key)
    }

    pub fn get_webhook_verifier(&self) -> Result<WebhookVerifier, WebhookError> {
        WebhookVerifier::from_secret(&self.identity_webhook_secret)
    }

    pub fn get_sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: std::time::Duration::from_secs(self.sync_interval_minutes * 60),
            concurrency: self.sync_concurrency.max(1),
            lease: chrono::Duration::minutes(self.sync_lease_minutes),
            admin_session_timeout: self.admin_session_timeout(),
        }
    }

    pub fn admin_session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.admin_session_timeout_minutes)
    }
}

/// Installs the global tracing subscriber. With an OTLP key configured,
/// spans are also exported and the returned guard must be kept alive.
pub fn setup_tracing(env: &Env) -> Option<TelemetryGuard> {
    let level: Level = (&env.log_level).into();

    if let Some(api_key) = &env.otlp_api_key {
        let config = TelemetryConfig {
            api_key: api_key.clone(),
            endpoint: env.otlp_endpoint.clone(),
            service_name: env.service_name.clone(),
        };

        match setup_telemetry(&config, level) {
            Ok(guard) => return Some(guard),
            Err(e) => eprintln!("Failed to set up telemetry, falling back to console logging: {e}"),
        }
    }

    setup_console_tracing(&env.log_level);
    None
}

pub fn setup_console_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = default_filter(level);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .compact()
        .try_init();
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn create_test_env() -> Env {
        Env {
            database_url: ":memory:".to_string(),
            log_level: LogLevel::Debug,
            broker: BrokerEnv {
                broker_api_url: "http://localhost:5000".to_string(),
                broker_api_key: None,
                broker_timeout_secs: 5,
                broker_dry_run: true,
            },
            payment: PaymentEnv {
                payment_api_url: "http://localhost:5100".to_string(),
                payment_api_key: "test-payment-key".to_string(),
                payment_callback_url: None,
                payment_success_url: None,
                payment_currency: "USD".to_string(),
                payment_timeout_secs: 5,
            },
            identity_webhook_secret: crate::webhook::tests::TEST_SECRET.to_string(),
            encryption_key: "BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=".to_string(),
            sync_interval_minutes: 30,
            sync_concurrency: 4,
            sync_lease_minutes: 25,
            admin_session_timeout_minutes: 30,
            server_port: 8080,
            otlp_api_key: None,
            otlp_endpoint: "https://otel.test/v1/traces".to_string(),
            service_name: "leadership-league".to_string(),
        }
    }

    #[test]
    fn test_log_level_from_conversion() {
        let level: Level = LogLevel::Trace.into();
        assert_eq!(Level::TRACE, level);

        let level: Level = LogLevel::Info.into();
        assert_eq!(Level::INFO, level);

        let level: Level = LogLevel::Error.into();
        assert_eq!(Level::ERROR, level);

        let log_level = LogLevel::Debug;
        let level: Level = (&log_level).into();
        assert_eq!(level, Level::DEBUG);
    }

    #[tokio::test]
    async fn test_env_sqlite_pool_creation() {
        let env = create_test_env();
        let pool_result = env.get_sqlite_pool().await;
        assert!(pool_result.is_ok());
    }

    #[test]
    fn test_get_broker_dry_run_modes() {
        let mut env = create_test_env();
        let broker = env.get_broker().unwrap();
        assert!(format!("{broker:?}").contains("DryRunBroker"));

        env.broker.broker_dry_run = false;
        let broker = env.get_broker().unwrap();
        assert!(format!("{broker:?}").contains("Mt5Broker"));

        env.broker.broker_api_url = "::not a url::".to_string();
        assert!(env.get_broker().is_err());
    }

    #[test]
    fn test_sync_config_from_env() {
        let mut env = create_test_env();
        env.sync_concurrency = 0;

        let config = env.get_sync_config();
        assert_eq!(config.interval, std::time::Duration::from_secs(1800));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.lease, chrono::Duration::minutes(25));
        assert_eq!(config.admin_session_timeout, chrono::Duration::minutes(30));
    }

    #[test]
    fn test_secrets_from_env() {
        let env = create_test_env();
        let cipher = env.get_cipher().unwrap();
        let encrypted = cipher.encrypt("hunter2").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "hunter2");

        env.get_webhook_verifier().unwrap();
        env.get_payment_gateway().unwrap();
    }

    #[test]
    fn test_env_parses_from_args() {
        let env = Env::try_parse_from([
            "server",
            "--db",
            "sqlite://league.db",
            "--identity-webhook-secret",
            "whsec_c2VjcmV0",
            "--encryption-key",
            "BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=",
            "--broker-dry-run",
            "--sync-interval-minutes",
            "15",
        ])
        .unwrap();

        assert_eq!(env.database_url, "sqlite://league.db");
        assert!(env.broker.broker_dry_run);
        assert_eq!(env.sync_interval_minutes, 15);
        assert_eq!(env.server_port, 8080);
        assert_eq!(env.payment.payment_currency, "USD");
    }
}
