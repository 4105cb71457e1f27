use async_trait::async_trait;
use serde_json::json;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::warn;

use crate::{
    Broker, BrokerError, CreateUserRequest, CreateUserResponse, Login, SupportedBroker,
    UserStats, UserStatsRequest,
};

/// Broker for local runs that logs operations instead of calling the bridge.
///
/// Statistics are derived from the login so repeated syncs of the same
/// account produce the same leaderboard.
#[derive(Debug, Clone)]
pub struct DryRunBroker {
    login_counter: Arc<AtomicU64>,
}

impl DryRunBroker {
    pub fn new() -> Self {
        Self {
            login_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    fn generate_login(&self) -> Login {
        let id = self.login_counter.fetch_add(1, Ordering::SeqCst);
        Login(format!("DRY_RUN_{id}"))
    }
}

impl Default for DryRunBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn login_seed(login: &Login) -> u64 {
    login
        .as_str()
        .bytes()
        .fold(17_u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)))
}

#[async_trait]
impl Broker for DryRunBroker {
    async fn create_user(
        &self,
        request: &CreateUserRequest,
    ) -> Result<CreateUserResponse, BrokerError> {
        let login = self.generate_login();

        warn!(
            "[DRY-RUN] Would create broker user {} <{}> in group {} (login: {login})",
            request.name, request.email, request.group
        );

        Ok(CreateUserResponse {
            login,
            password: Some("dry-run-password".to_string()),
            investor_password: None,
            server: Some("DRY-RUN".to_string()),
        })
    }

    async fn user_stats(&self, request: &UserStatsRequest) -> Result<UserStats, BrokerError> {
        warn!("[DRY-RUN] Returning synthetic stats for login {}", request.login);

        let seed = login_seed(&request.login);
        let realized = ((seed % 4_001) as f64) - 2_000.0;
        let floating = ((seed % 201) as f64) - 100.0;
        let equity = 10_000.0 + realized + floating;

        UserStats::from_response(json!({
            "snapshot": {
                "equity": equity,
                "margin": (seed % 500) as f64,
                "open_positions": seed % 5,
            },
            "total_pnl": realized + floating,
            "realized_pnl": realized,
            "floating_pnl": floating,
        }))
    }

    fn to_supported_broker(&self) -> SupportedBroker {
        SupportedBroker::DryRun
    }
}
