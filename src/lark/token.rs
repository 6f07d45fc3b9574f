//! Tenant access token cache.
//!
//! Refresh is lazy: every outbound call asks for a token and a stale one is
//! renewed inline. The lock is held across the renewal so concurrent callers
//! wait for the single in-flight refresh instead of starting their own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ApiError;

/// Tokens older than this are renewed before use.
pub const TOKEN_TTL_SECS: i64 = 1200;

const TENANT_ACCESS_TOKEN_PATH: &str = "/open-apis/auth/v3/tenant_access_token/internal";

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > Duration::seconds(TOKEN_TTL_SECS)
    }
}

/// Something that can mint a fresh tenant access token.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<String, ApiError>;
}

pub struct TokenCache {
    issuer: Arc<dyn TokenIssuer>,
    current: Mutex<Option<Credential>>,
}

impl TokenCache {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            issuer,
            current: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, refreshing it first if stale.
    pub async fn get_token(&self) -> Result<String, ApiError> {
        self.get_token_at(Utc::now()).await
    }

    /// On failure the previous (stale) credential stays cached and the error
    /// is returned; the next call tries again.
    pub async fn get_token_at(&self, now: DateTime<Utc>) -> Result<String, ApiError> {
        let mut current = self.current.lock().await;
        if let Some(credential) = current.as_ref() {
            if !credential.is_stale(now) {
                return Ok(credential.token.clone());
            }
            debug!(
                issued_at = %credential.issued_at,
                "Tenant access token is stale, refreshing"
            );
        }

        match self.issuer.issue().await {
            Ok(token) => {
                info!("Tenant access token refreshed");
                *current = Some(Credential {
                    token: token.clone(),
                    issued_at: now,
                });
                Ok(token)
            }
            Err(e) => {
                warn!("Failed to refresh tenant access token: {}", e);
                Err(e)
            }
        }
    }

    pub async fn current(&self) -> Option<Credential> {
        self.current.lock().await.clone()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default = "missing_code")]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
}

fn missing_code() -> i64 {
    -1
}

/// Issues tokens from the platform's internal-app endpoint.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    url: String,
    app_id: String,
    app_secret: String,
}

impl HttpTokenIssuer {
    pub fn new(client: reqwest::Client, host: &str, app_id: &str, app_secret: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", host, TENANT_ACCESS_TOKEN_PATH),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
        }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self) -> Result<String, ApiError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed: TokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Authentication {
                    code: i64::from(status.as_u16()),
                    msg: body,
                })
            }
            Err(e) => {
                return Err(ApiError::Authentication {
                    code: -1,
                    msg: format!("unreadable token response: {}", e),
                })
            }
        };

        if !status.is_success() || parsed.code != 0 {
            return Err(ApiError::Authentication {
                code: parsed.code,
                msg: parsed.msg,
            });
        }

        parsed.tenant_access_token.ok_or(ApiError::Authentication {
            code: -1,
            msg: "response carried no tenant_access_token".to_string(),
        })
    }
}
