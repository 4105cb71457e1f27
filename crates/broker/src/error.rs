use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("JSON serialization failed: {0}")]
    JsonSerialization(#[from] serde_json::Error),
    #[error("{action} failed with status: {status}, body: {body}")]
    RequestFailed {
        action: String,
        status: StatusCode,
        body: String,
    },
    #[error("Broker rejected {action}: {message}")]
    Rejected { action: String, message: String },
    #[error("Failed to parse {action} response: {reason}")]
    ResponseParse { action: String, reason: String },
    #[error("Invalid broker configuration: {0}")]
    InvalidConfiguration(String),
}
