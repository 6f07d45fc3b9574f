use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::LarkConfig;
use crate::error::ApiError;
use crate::lark::message::RenderMessage;
use crate::lark::token::{HttpTokenIssuer, TokenCache};
use crate::lark::user::{UserLookup, UserProfile};

/// Client for the Lark open platform. Every call carries a tenant access
/// token from the shared [`TokenCache`].
pub struct ApiClient {
    http: reqwest::Client,
    host: String,
    tokens: Arc<TokenCache>,
}

impl ApiClient {
    pub fn new(config: &LarkConfig) -> Self {
        let http = reqwest::Client::new();
        let issuer = HttpTokenIssuer::new(
            http.clone(),
            &config.host,
            &config.app_id,
            &config.app_secret,
        );
        Self::with_tokens(http, &config.host, Arc::new(TokenCache::new(Arc::new(issuer))))
    }

    pub fn with_tokens(http: reqwest::Client, host: &str, tokens: Arc<TokenCache>) -> Self {
        Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    pub async fn send_message_with_open_id(
        &self,
        open_id: &str,
        msg: &RenderMessage,
    ) -> Result<Value, ApiError> {
        self.send_message("open_id", open_id, msg).await
    }

    pub async fn send_message_with_chat_id(
        &self,
        chat_id: &str,
        msg: &RenderMessage,
    ) -> Result<Value, ApiError> {
        self.send_message("chat_id", chat_id, msg).await
    }

    pub async fn reply_message(
        &self,
        message_id: &str,
        msg: &RenderMessage,
    ) -> Result<Value, ApiError> {
        let url = format!("{}/open-apis/im/v1/messages/{}/reply", self.host, message_id);
        self.post_json(&url, &[], &msg.to_body(None)).await
    }

    pub async fn get_user_info(&self, open_id: &str) -> Result<Value, ApiError> {
        let url = format!("{}/open-apis/contact/v3/users/{}", self.host, open_id);
        self.get_json(
            &url,
            &[
                ("user_id_type", "open_id"),
                ("department_id_type", "open_department_id"),
            ],
        )
        .await
    }

    async fn send_message(
        &self,
        receive_id_type: &str,
        receive_id: &str,
        msg: &RenderMessage,
    ) -> Result<Value, ApiError> {
        let url = format!("{}/open-apis/im/v1/messages", self.host);
        self.post_json(
            &url,
            &[("receive_id_type", receive_id_type)],
            &msg.to_body(Some(receive_id)),
        )
        .await
    }

    async fn post_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> Result<Value, ApiError> {
        let token = self.tokens.get_token().await?;
        debug!("POST {}", url);
        let response = self
            .http
            .post(url)
            .query(query)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        check_envelope(response).await
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let token = self.tokens.get_token().await?;
        debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .send()
            .await?;
        check_envelope(response).await
    }
}

/// A non-zero `code` is a failure whatever the HTTP status says.
async fn check_envelope(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    let value: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) if !status.is_success() => return Err(ApiError::Status { status, body }),
        Err(e) => {
            return Err(ApiError::Platform {
                code: -1,
                msg: format!("unreadable response: {}", e),
            })
        }
    };

    let code = value.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 0 {
        let msg = value
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ApiError::Platform { code, msg });
    }
    Ok(value)
}

#[async_trait]
impl UserLookup for ApiClient {
    async fn lookup_user(&self, open_id: &str) -> Result<UserProfile, ApiError> {
        let value = self.get_user_info(open_id).await?;
        let user = value
            .pointer("/data/user")
            .filter(|u| u.is_object())
            .cloned()
            .ok_or_else(|| ApiError::Platform {
                code: -1,
                msg: "response carried no data.user".to_string(),
            })?;
        serde_json::from_value(user).map_err(|e| ApiError::Platform {
            code: -1,
            msg: format!("unexpected user shape: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lark::token::TokenIssuer;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticIssuer;

    #[async_trait]
    impl TokenIssuer for StaticIssuer {
        async fn issue(&self) -> Result<String, ApiError> {
            Ok("t-static".to_string())
        }
    }

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::with_tokens(
            reqwest::Client::new(),
            &server.uri(),
            Arc::new(TokenCache::new(Arc::new(StaticIssuer))),
        )
    }

    #[tokio::test]
    async fn test_send_message_carries_bearer_and_receiver() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/open-apis/im/v1/messages"))
            .and(query_param("receive_id_type", "chat_id"))
            .and(header("Authorization", "Bearer t-static"))
            .and(body_partial_json(json!({"receive_id": "oc_1", "msg_type": "text"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 0, "msg": "success", "data": {}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let msg: RenderMessage = RenderMessage::text("hi").into();
        client(&server)
            .send_message_with_chat_id("oc_1", &msg)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reply_message_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/open-apis/im/v1/messages/om_9/reply"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
            .expect(1)
            .mount(&server)
            .await;

        let msg: RenderMessage = RenderMessage::text("re").into();
        client(&server).reply_message("om_9", &msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_code_is_error_even_with_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 230002, "msg": "bot not in chat"})),
            )
            .mount(&server)
            .await;

        let msg: RenderMessage = RenderMessage::text("hi").into();
        let err = client(&server)
            .send_message_with_open_id("ou_1", &msg)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Platform { code: 230002, .. }));
    }

    #[tokio::test]
    async fn test_lookup_user_parses_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/open-apis/contact/v3/users/ou_1"))
            .and(query_param("user_id_type", "open_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"user": {"union_id": "on_1", "name": "Alice", "description": "dev"}}
            })))
            .mount(&server)
            .await;

        let profile = client(&server).lookup_user("ou_1").await.unwrap();
        assert_eq!(profile.name, "Alice");
        assert_eq!(profile.union_id.as_deref(), Some("on_1"));
    }

    #[tokio::test]
    async fn test_lookup_user_without_user_block_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {}})))
            .mount(&server)
            .await;

        assert!(client(&server).lookup_user("ou_1").await.is_err());
    }
}
