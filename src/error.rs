use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Why an inbound webhook push was rejected.
#[derive(Debug, Error)]
pub enum EventError {
    /// Body is not structured data, or lacks the header/event blocks.
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// Token or signature mismatch, or a payload that fails to decrypt.
    #[error("Invalid event: {0}")]
    Invalid(String),

    /// The push needs an encryption key this server does not have.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EventError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::Invalid(_) => StatusCode::UNAUTHORIZED,
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EventError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Outbound call to the Lark open platform failed.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Tenant access token issuance was refused.
    #[error("Authentication failed ({code}): {msg}")]
    Authentication { code: i64, msg: String },

    /// A business call returned a non-zero `code` in its envelope.
    #[error("Lark API error ({code}): {msg}")]
    Platform { code: i64, msg: String },

    /// Non-success HTTP status without a parseable envelope.
    #[error("Lark API returned HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A plugin hook failed. Contained to the plugin and only ever logged.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' failed to initialize: {reason:#}")]
    Init {
        plugin: String,
        reason: anyhow::Error,
    },

    #[error("plugin '{plugin}' failed while handling: {reason:#}")]
    Runtime {
        plugin: String,
        reason: anyhow::Error,
    },
}
