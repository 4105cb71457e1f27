use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display};
use std::sync::Arc;

pub mod dry_run;
pub mod error;
pub mod mt5;
pub mod provisioning;
pub mod stats;

pub use dry_run::DryRunBroker;
pub use error::BrokerError;
pub use mt5::{BrokerEnv, Mt5Broker};
pub use provisioning::{CreateUserRequest, CreateUserResponse};
pub use stats::{StatsRange, UserStats, UserStatsRequest};
pub use test::TestBroker;

/// Trading account identifier assigned by the broker.
///
/// MT5 bridges report logins as JSON numbers or strings depending on the
/// endpoint, so both are accepted. Numeric logins are sent back as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Login(pub String);

impl Login {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Login {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for Login {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.0.parse::<u64>() {
            Ok(numeric) => serializer.serialize_u64(numeric),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Login {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawLogin {
            Number(u64),
            Text(String),
        }

        match RawLogin::deserialize(deserializer)? {
            RawLogin::Number(login) => Ok(Self(login.to_string())),
            RawLogin::Text(login) if !login.trim().is_empty() => Ok(Self(login.trim().to_string())),
            RawLogin::Text(_) => Err(serde::de::Error::custom("broker login is empty")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedBroker {
    Mt5,
    DryRun,
    Test,
}

impl Display for SupportedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mt5 => write!(f, "mt5"),
            Self::DryRun => write!(f, "dry_run"),
            Self::Test => write!(f, "test"),
        }
    }
}

#[async_trait]
pub trait Broker: Debug + Send + Sync + 'static {
    /// Provisions a new trading account on the broker side.
    async fn create_user(
        &self,
        request: &CreateUserRequest,
    ) -> Result<CreateUserResponse, BrokerError>;

    /// Fetches live performance statistics for a login, optionally bounded
    /// to a time range.
    async fn user_stats(&self, request: &UserStatsRequest) -> Result<UserStats, BrokerError>;

    fn to_supported_broker(&self) -> SupportedBroker;
}

pub type DynBroker = Arc<dyn Broker>;
