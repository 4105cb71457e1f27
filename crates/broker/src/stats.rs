use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BrokerError, Login};

/// Optional time window for broker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStatsRequest {
    pub login: Login,
    #[serde(flatten)]
    pub range: StatsRange,
}

impl UserStatsRequest {
    pub fn new(login: Login) -> Self {
        Self {
            login,
            range: StatsRange::default(),
        }
    }

    #[must_use]
    pub fn with_range(mut self, range: StatsRange) -> Self {
        self.range = range;
        self
    }
}

/// Performance figures extracted from a `user-stats` response. The broker
/// payload is loosely typed, so every figure is optional and the raw body is
/// kept alongside for auditing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStats {
    pub equity: Option<f64>,
    pub margin: Option<f64>,
    pub open_positions: Option<i64>,
    pub total_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub floating_pnl: Option<f64>,
    pub raw: Value,
}

impl UserStats {
    pub fn from_response(raw: Value) -> Result<Self, BrokerError> {
        const ACTION: &str = "user-stats";

        if !raw.is_object() {
            return Err(BrokerError::ResponseParse {
                action: ACTION.to_string(),
                reason: format!("expected a JSON object, got {raw}"),
            });
        }

        if let Some(message) = rejection_message(&raw) {
            return Err(BrokerError::Rejected {
                action: ACTION.to_string(),
                message,
            });
        }

        Ok(Self {
            equity: number_at(&raw, "/snapshot/equity"),
            margin: number_at(&raw, "/snapshot/margin"),
            open_positions: count_at(&raw, "/snapshot/open_positions"),
            total_pnl: number_at(&raw, "/total_pnl"),
            realized_pnl: number_at(&raw, "/realized_pnl"),
            floating_pnl: number_at(&raw, "/floating_pnl"),
            raw,
        })
    }
}

/// Returns the broker's error message when the body carries
/// `"success": false`.
pub(crate) fn rejection_message(raw: &Value) -> Option<String> {
    if raw.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }

    let message = ["error", "message"]
        .iter()
        .find_map(|key| raw.get(*key).and_then(Value::as_str))
        .unwrap_or("no reason given");

    Some(message.to_string())
}

fn number_at(raw: &Value, pointer: &str) -> Option<f64> {
    match raw.pointer(pointer)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn count_at(raw: &Value, pointer: &str) -> Option<i64> {
    match raw.pointer(pointer)? {
        Value::Array(positions) => i64::try_from(positions.len()).ok(),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|count| count as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
