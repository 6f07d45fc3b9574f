use std::collections::HashMap;

use axum::body::Bytes;
use serde_json::Value;

/// A synchronous HTTP callback addressed to a plugin-owned path.
#[derive(Debug, Clone)]
pub struct PathRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub form: HashMap<String, String>,
    /// Form and query merged; query wins on conflict.
    pub params: HashMap<String, String>,
    /// Decoded body, when it looks like JSON and parses.
    pub json: Option<Value>,
    pub body: Bytes,
}

impl PathRequest {
    pub fn new(
        method: &str,
        path: &str,
        raw_query: Option<&str>,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Self {
        let query = raw_query.map(parse_urlencoded).unwrap_or_default();

        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
        let form = if content_type.starts_with("application/x-www-form-urlencoded") {
            std::str::from_utf8(&body)
                .map(parse_urlencoded)
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        let mut params = form.clone();
        params.extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));

        let looks_like_json = content_type.starts_with("application/json")
            || matches!(body.first(), Some(b'{') | Some(b'['));
        let json = if looks_like_json {
            serde_json::from_slice(&body).ok()
        } else {
            None
        };

        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query,
            form,
            params,
            json,
            body,
        }
    }

    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }

    pub fn is_json(&self) -> bool {
        self.json.is_some()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

fn parse_urlencoded(raw: &str) -> HashMap<String, String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(raw)
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}
