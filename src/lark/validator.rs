//! Authenticates and decodes inbound webhook pushes.

use axum::http::HeaderMap;
use serde_json::Value;
use tracing::warn;

use crate::error::EventError;
use crate::lark::crypto::{self, AesCipher};
use crate::lark::event::NormalizedEvent;

pub const HEADER_TIMESTAMP: &str = "x-lark-request-timestamp";
pub const HEADER_NONCE: &str = "x-lark-request-nonce";
pub const HEADER_SIGNATURE: &str = "x-lark-signature";

const URL_VERIFICATION: &str = "url_verification";

/// The platform-declared request headers the signature is computed over.
#[derive(Debug, Clone, Default)]
pub struct SignatureHeaders {
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub signature: Option<String>,
}

impl SignatureHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            timestamp: get(HEADER_TIMESTAMP),
            nonce: get(HEADER_NONCE),
            signature: get(HEADER_SIGNATURE),
        }
    }
}

/// Result of a successful validation.
#[derive(Debug)]
pub enum Validated {
    /// URL-verification handshake; echo the challenge back.
    Challenge(String),
    Event(NormalizedEvent),
}

pub struct EventValidator {
    verification_token: String,
    encrypt_key: Option<String>,
}

impl EventValidator {
    pub fn new(verification_token: impl Into<String>, encrypt_key: Option<String>) -> Self {
        Self {
            verification_token: verification_token.into(),
            encrypt_key,
        }
    }

    pub fn validate(
        &self,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<Validated, EventError> {
        let doc: Value = serde_json::from_slice(raw_body)
            .map_err(|e| EventError::Malformed(format!("body is not JSON: {}", e)))?;
        if !doc.is_object() {
            return Err(EventError::Malformed("body is not a JSON object".to_string()));
        }

        let doc = self.decrypt(doc)?;

        if doc.get("type").and_then(Value::as_str) == Some(URL_VERIFICATION) {
            return self.verify_handshake(&doc);
        }

        let event = NormalizedEvent::from_document(&doc)?;

        if event.header().token != self.verification_token {
            warn!(event_id = %event.event_id(), "Event carries an invalid verification token");
            return Err(EventError::Invalid("invalid token".to_string()));
        }

        self.verify_signature(raw_body, headers)?;

        Ok(Validated::Event(event))
    }

    fn decrypt(&self, doc: Value) -> Result<Value, EventError> {
        let encrypted = match doc.get("encrypt") {
            None | Some(Value::Null) => return Ok(doc),
            Some(Value::String(s)) => s,
            Some(_) => {
                return Err(EventError::Malformed(
                    "encrypt field is not a string".to_string(),
                ))
            }
        };
        let key = self.encrypt_key.as_deref().ok_or_else(|| {
            EventError::Configuration(
                "received an encrypted event but no encrypt key is configured".to_string(),
            )
        })?;

        let plaintext = AesCipher::new(key).decrypt_string(encrypted).map_err(|e| {
            warn!("Failed to decrypt event payload: {}", e);
            EventError::Invalid(format!("cannot decrypt payload: {}", e))
        })?;
        serde_json::from_str(&plaintext)
            .map_err(|e| EventError::Invalid(format!("decrypted payload is not JSON: {}", e)))
    }

    fn verify_handshake(&self, doc: &Value) -> Result<Validated, EventError> {
        if doc.get("token").and_then(Value::as_str) != Some(self.verification_token.as_str()) {
            warn!("URL verification with an invalid token");
            return Err(EventError::Invalid("invalid verification token".to_string()));
        }
        doc.get("challenge")
            .and_then(Value::as_str)
            .map(|c| Validated::Challenge(c.to_string()))
            .ok_or_else(|| EventError::Malformed("url_verification without challenge".to_string()))
    }

    fn verify_signature(&self, raw_body: &[u8], headers: &SignatureHeaders) -> Result<(), EventError> {
        let (Some(timestamp), Some(nonce), Some(signature)) = (
            headers.timestamp.as_deref(),
            headers.nonce.as_deref(),
            headers.signature.as_deref(),
        ) else {
            warn!("Event is missing signature headers");
            return Err(EventError::Invalid("missing signature headers".to_string()));
        };

        let key = self.encrypt_key.as_deref().unwrap_or("");
        if !crypto::verify_signature(timestamp, nonce, key, raw_body, signature) {
            warn!("Event signature mismatch");
            return Err(EventError::Invalid("invalid signature in event".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lark::crypto::compute_signature;
    use crate::lark::event::tests::receive_document;
    use serde_json::json;

    fn signed(key: &str, body: &[u8]) -> SignatureHeaders {
        SignatureHeaders {
            timestamp: Some("1700000000".to_string()),
            nonce: Some("nonce".to_string()),
            signature: Some(compute_signature("1700000000", "nonce", key, body)),
        }
    }

    #[test]
    fn test_url_verification_echoes_challenge() {
        let validator = EventValidator::new("T", None);
        let body = br#"{"type":"url_verification","token":"T","challenge":"abc"}"#;

        match validator.validate(body, &SignatureHeaders::default()).unwrap() {
            Validated::Challenge(c) => assert_eq!(c, "abc"),
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    #[test]
    fn test_url_verification_with_wrong_token() {
        let validator = EventValidator::new("T", None);
        let body = br#"{"type":"url_verification","token":"nope","challenge":"abc"}"#;

        assert!(matches!(
            validator.validate(body, &SignatureHeaders::default()),
            Err(EventError::Invalid(_))
        ));
    }

    #[test]
    fn test_signed_plain_event_accepted() {
        let validator = EventValidator::new("vt", Some("ek".to_string()));
        let body = serde_json::to_vec(&receive_document("{\"text\":\"hi\"}")).unwrap();

        match validator.validate(&body, &signed("ek", &body)).unwrap() {
            Validated::Event(event) => {
                assert_eq!(event.event_type(), "im.message.receive_v1");
                assert_eq!(event.event_id(), "ev-1");
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_signature_without_encrypt_key_uses_empty_key() {
        let validator = EventValidator::new("vt", None);
        let body = serde_json::to_vec(&receive_document("{}")).unwrap();

        assert!(validator.validate(&body, &signed("", &body)).is_ok());
        assert!(matches!(
            validator.validate(&body, &signed("ek", &body)),
            Err(EventError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_signature_or_missing_headers_rejected() {
        let validator = EventValidator::new("vt", Some("ek".to_string()));
        let body = serde_json::to_vec(&receive_document("{}")).unwrap();

        let mut headers = signed("ek", &body);
        headers.nonce = Some("other".to_string());
        assert!(matches!(
            validator.validate(&body, &headers),
            Err(EventError::Invalid(_))
        ));

        let mut headers = signed("ek", &body);
        headers.signature = None;
        assert!(matches!(
            validator.validate(&body, &headers),
            Err(EventError::Invalid(_))
        ));
    }

    #[test]
    fn test_token_mismatch_rejected_before_signature() {
        let validator = EventValidator::new("expected", Some("ek".to_string()));
        let body = serde_json::to_vec(&receive_document("{}")).unwrap();

        assert!(matches!(
            validator.validate(&body, &signed("ek", &body)),
            Err(EventError::Invalid(msg)) if msg.contains("token")
        ));
    }

    #[test]
    fn test_missing_blocks_are_malformed() {
        let validator = EventValidator::new("vt", None);
        let body = br#"{"schema":"2.0","header":{"event_type":"x","token":"vt"}}"#;
        assert!(matches!(
            validator.validate(body, &signed("", body)),
            Err(EventError::Malformed(_))
        ));
        assert!(matches!(
            validator.validate(b"not json", &SignatureHeaders::default()),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn test_encrypted_event_is_decrypted() {
        let key = "encrypt-key";
        let inner = receive_document("{\"text\":\"secret\"}");
        let encrypt = AesCipher::new(key).encrypt_string(&inner.to_string(), [3u8; 16]);
        let body = serde_json::to_vec(&json!({ "encrypt": encrypt })).unwrap();
        let validator = EventValidator::new("vt", Some(key.to_string()));

        match validator.validate(&body, &signed(key, &body)).unwrap() {
            Validated::Event(event) => {
                assert_eq!(event.body(), inner.get("event").unwrap());
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_handshake() {
        let key = "encrypt-key";
        let inner = json!({"type": "url_verification", "token": "vt", "challenge": "xyz"});
        let encrypt = AesCipher::new(key).encrypt_string(&inner.to_string(), [9u8; 16]);
        let body = serde_json::to_vec(&json!({ "encrypt": encrypt })).unwrap();
        let validator = EventValidator::new("vt", Some(key.to_string()));

        assert!(matches!(
            validator.validate(&body, &SignatureHeaders::default()),
            Ok(Validated::Challenge(c)) if c == "xyz"
        ));
    }

    #[test]
    fn test_encrypted_event_without_key_is_configuration_error() {
        let validator = EventValidator::new("vt", None);
        let body = br#"{"encrypt":"AAAA"}"#;

        assert!(matches!(
            validator.validate(body, &SignatureHeaders::default()),
            Err(EventError::Configuration(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_is_invalid() {
        let validator = EventValidator::new("vt", Some("k".to_string()));
        let body = br#"{"encrypt":"definitely-not-ciphertext"}"#;

        assert!(matches!(
            validator.validate(body, &SignatureHeaders::default()),
            Err(EventError::Invalid(_))
        ));
    }

    #[test]
    fn test_signature_headers_from_header_map() {
        let mut map = HeaderMap::new();
        map.insert(HEADER_TIMESTAMP, "1".parse().unwrap());
        map.insert(HEADER_NONCE, "n".parse().unwrap());
        let headers = SignatureHeaders::from_headers(&map);

        assert_eq!(headers.timestamp.as_deref(), Some("1"));
        assert_eq!(headers.nonce.as_deref(), Some("n"));
        assert!(headers.signature.is_none());
    }
}
