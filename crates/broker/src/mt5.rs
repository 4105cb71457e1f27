use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::{
    Broker, BrokerError, CreateUserRequest, CreateUserResponse, SupportedBroker, UserStats,
    UserStatsRequest,
};

#[derive(Parser, Debug, Clone)]
pub struct BrokerEnv {
    /// Base URL of the MT5 bridge API
    #[clap(long, env, default_value = "http://localhost:5000")]
    pub broker_api_url: String,
    /// Bearer key sent to the MT5 bridge, if it requires one
    #[clap(long, env)]
    pub broker_api_key: Option<String>,
    /// Request timeout in seconds for broker calls
    #[clap(long, env, default_value = "30")]
    pub broker_timeout_secs: u64,
    /// Log broker calls and return synthetic data instead of calling the bridge
    #[clap(long, env, default_value = "false")]
    pub broker_dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct Mt5Broker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Mt5Broker {
    pub fn try_from_env(env: &BrokerEnv) -> Result<Self, BrokerError> {
        let base_url = url::Url::parse(&env.broker_api_url).map_err(|e| {
            BrokerError::InvalidConfiguration(format!(
                "invalid broker API URL {}: {e}",
                env.broker_api_url
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(env.broker_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            api_key: env.broker_api_key.clone(),
        })
    }

    async fn post_json<B>(&self, action: &str, path: &str, body: &B) -> Result<Value, BrokerError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::RequestFailed {
                action: action.to_string(),
                status,
                body,
            });
        }

        let text = response.text().await?;
        debug!("{action} response: {text}");

        serde_json::from_str(&text).map_err(|e| BrokerError::ResponseParse {
            action: action.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Broker for Mt5Broker {
    async fn create_user(
        &self,
        request: &CreateUserRequest,
    ) -> Result<CreateUserResponse, BrokerError> {
        let raw = self
            .post_json("create-user", "/api/create-user", request)
            .await?;

        CreateUserResponse::from_response(raw)
    }

    async fn user_stats(&self, request: &UserStatsRequest) -> Result<UserStats, BrokerError> {
        let raw = self
            .post_json("user-stats", "/api/user-stats", request)
            .await?;

        UserStats::from_response(raw)
    }

    fn to_supported_broker(&self) -> SupportedBroker {
        SupportedBroker::Mt5
    }
}
