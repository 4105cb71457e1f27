use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stats::rejection_message;
use crate::{BrokerError, Login};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub group: String,
    pub leverage: u32,
    /// Initial balance in account currency units.
    pub deposit: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateUserResponse {
    pub login: Login,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub investor_password: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
}

impl CreateUserResponse {
    pub fn from_response(raw: Value) -> Result<Self, BrokerError> {
        const ACTION: &str = "create-user";

        if let Some(message) = rejection_message(&raw) {
            return Err(BrokerError::Rejected {
                action: ACTION.to_string(),
                message,
            });
        }

        // Some bridge versions wrap the account in a `user` object.
        let body = raw.get("user").cloned().unwrap_or(raw);

        serde_json::from_value(body).map_err(|e| BrokerError::ResponseParse {
            action: ACTION.to_string(),
            reason: e.to_string(),
        })
    }
}
