use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PaymentError;

#[derive(Parser, Debug, Clone)]
pub struct PaymentEnv {
    /// Base URL of the payment provider API
    #[clap(long, env, default_value = "http://localhost:5100")]
    pub payment_api_url: String,
    /// Bearer key for the payment provider
    #[clap(long, env, default_value = "")]
    pub payment_api_key: String,
    /// URL the provider calls with payment status updates
    #[clap(long, env)]
    pub payment_callback_url: Option<String>,
    /// URL the payer is sent to after paying
    #[clap(long, env)]
    pub payment_success_url: Option<String>,
    #[clap(long, env, default_value = "USD")]
    pub payment_currency: String,
    #[clap(long, env, default_value = "30")]
    pub payment_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceRequest {
    pub order_id: String,
    pub amount: f64,
    pub currency: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_url: Option<String>,
    pub metadata: InvoiceMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceMetadata {
    pub order_id: String,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub league_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub invoice_id: Option<String>,
    pub invoice_url: Option<String>,
}

impl Invoice {
    /// Reads `data.success` and the invoice identifiers from a provider
    /// response. Anything but an explicit `true` is a rejection.
    fn from_response(order_id: &str, raw: &Value) -> Result<Self, PaymentError> {
        let data = raw.get("data").unwrap_or(raw);

        if data.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(PaymentError::InvoiceRejected {
                order_id: order_id.to_string(),
            });
        }

        let text = |keys: &[&str]| {
            keys.iter().find_map(|key| match data.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
        };

        Ok(Self {
            invoice_id: text(&["invoice_id", "id", "track_id"]),
            invoice_url: text(&["invoice_url", "url", "payment_url"]),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    callback_url: Option<String>,
    success_url: Option<String>,
    currency: String,
}

impl PaymentGateway {
    pub fn try_from_env(env: &PaymentEnv) -> Result<Self, PaymentError> {
        let base_url = url::Url::parse(&env.payment_api_url).map_err(|e| {
            PaymentError::InvalidConfiguration(format!(
                "invalid payment API URL {}: {e}",
                env.payment_api_url
            ))
        })?;

        if env.payment_api_key.is_empty() {
            warn!("No payment API key configured; invoice requests will be unauthenticated");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(env.payment_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            api_key: env.payment_api_key.clone(),
            callback_url: env.payment_callback_url.clone(),
            success_url: env.payment_success_url.clone(),
            currency: env.payment_currency.clone(),
        })
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub(crate) fn invoice_request(
        &self,
        order_id: &str,
        amount_cents: i64,
        description: String,
        user_id: i64,
        league_id: Option<i64>,
    ) -> InvoiceRequest {
        #[allow(clippy::cast_precision_loss)]
        let amount = amount_cents as f64 / 100.0;

        InvoiceRequest {
            order_id: order_id.to_string(),
            amount,
            currency: self.currency.clone(),
            description,
            callback_url: self.callback_url.clone(),
            success_url: self.success_url.clone(),
            metadata: InvoiceMetadata {
                order_id: order_id.to_string(),
                user_id,
                league_id,
            },
        }
    }

    pub async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, PaymentError> {
        let response = self
            .client
            .post(format!("{}/api/invoices/create", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::RequestFailed {
                action: "create invoice".to_string(),
                status,
                body,
            });
        }

        let raw: Value = response.json().await?;
        debug!("Invoice response for order {}: {raw}", request.order_id);

        Invoice::from_response(&request.order_id, &raw)
    }
}
