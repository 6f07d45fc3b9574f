use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::EventError;
use crate::lark::user::UserInfo;

/// Event types the dispatcher knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    MessageReceive,
    MessageRead,
}

impl EventType {
    pub const ALL: [EventType; 2] = [EventType::MessageReceive, EventType::MessageRead];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageReceive => "im.message.receive_v1",
            EventType::MessageRead => "im.message.message_read_v1",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header block of a v2 event envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventHeader {
    #[serde(default)]
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub tenant_key: Option<String>,
}

/// A validated push: stable header plus the arbitrary event body.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    header: EventHeader,
    body: Value,
}

impl NormalizedEvent {
    /// Split a decoded envelope into header and body. Both blocks must be
    /// present.
    pub fn from_document(doc: &Value) -> Result<Self, EventError> {
        let (header, body) = match (doc.get("header"), doc.get("event")) {
            (Some(h), Some(e)) if !h.is_null() && !e.is_null() => (h, e),
            _ => {
                return Err(EventError::Malformed(
                    "request is not a v2 callback event (missing header or event)".to_string(),
                ))
            }
        };
        let header: EventHeader = serde_json::from_value(header.clone())
            .map_err(|e| EventError::Malformed(format!("bad event header: {}", e)))?;
        Ok(Self {
            header,
            body: body.clone(),
        })
    }

    pub fn event_type(&self) -> &str {
        &self.header.event_type
    }

    /// The routing discriminator, if this is an event type we recognize.
    pub fn kind(&self) -> Option<EventType> {
        EventType::parse(&self.header.event_type)
    }

    pub fn event_id(&self) -> &str {
        &self.header.event_id
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Look up a value in the event body by dotted path, e.g.
    /// `"message.chat_id"` or `"message.mentions.0.name"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.body, path)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }
}

pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserId {
    #[serde(default)]
    pub open_id: Option<String>,
    #[serde(default)]
    pub union_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

/// `im.message.receive_v1` with the message fields pulled out.
#[derive(Debug, Clone)]
pub struct ReceiveMessage {
    pub event: NormalizedEvent,
    pub message_id: String,
    pub chat_id: String,
    /// `p2p` or `group`.
    pub chat_type: String,
    pub message_type: String,
    /// Raw JSON-encoded content as delivered.
    pub content: String,
    /// Plain text, when the content is a text message.
    pub text: Option<String>,
    pub mentions: Vec<Mention>,
    pub sender: UserId,
    pub sender_type: String,
    /// Resolved sender profile; `None` when the lookup failed with nothing
    /// cached.
    pub sender_info: Option<UserInfo>,
}

impl ReceiveMessage {
    /// Never fails. Each field is read on its own, so an unexpected leaf
    /// only blanks that field; unparseable content means non-text.
    pub fn from_event(event: NormalizedEvent) -> Self {
        let body = event.body();
        let message_id = string_at(body, "message.message_id");
        let chat_id = string_at(body, "message.chat_id");
        let chat_type = string_at(body, "message.chat_type");
        let message_type = string_at(body, "message.message_type");
        let content = string_at(body, "message.content");
        let mentions = match lookup(body, "message.mentions") {
            Some(Value::Array(items)) => items.iter().map(Mention::from_value).collect(),
            Some(other) if !other.is_null() => {
                debug!(event_id = %event.event_id(), "Ignoring mentions of unexpected shape");
                Vec::new()
            }
            _ => Vec::new(),
        };
        let sender = UserId::from_value(lookup(body, "sender.sender_id"));
        let sender_type = string_at(body, "sender.sender_type");
        let text = parse_text_content(&content);

        Self {
            message_id,
            chat_id,
            chat_type,
            message_type,
            content,
            text,
            mentions,
            sender,
            sender_type,
            sender_info: None,
            event,
        }
    }

    pub fn with_sender_info(mut self, info: Option<UserInfo>) -> Self {
        self.sender_info = info;
        self
    }

    pub fn is_text(&self) -> bool {
        self.text.is_some()
    }

    pub fn is_group(&self) -> bool {
        self.chat_type == "group"
    }

    pub fn sender_open_id(&self) -> Option<&str> {
        self.sender.open_id.as_deref()
    }

    pub fn mentioned_open_ids(&self) -> HashSet<&str> {
        self.mentions
            .iter()
            .filter_map(|m| m.id.open_id.as_deref())
            .collect()
    }

    /// Whether the bot itself was mentioned.
    pub fn at_me(&self, self_open_id: Option<&str>) -> bool {
        match self_open_id {
            Some(me) => self.mentioned_open_ids().contains(me),
            None => false,
        }
    }
}

fn string_at(value: &Value, path: &str) -> String {
    lookup(value, path)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn optional_string_at(value: &Value, path: &str) -> Option<String> {
    lookup(value, path).and_then(Value::as_str).map(str::to_string)
}

impl UserId {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(value) => Self {
                open_id: optional_string_at(value, "open_id"),
                union_id: optional_string_at(value, "union_id"),
                user_id: optional_string_at(value, "user_id"),
            },
            None => Self::default(),
        }
    }
}

impl Mention {
    fn from_value(value: &Value) -> Self {
        Self {
            key: string_at(value, "key"),
            id: UserId::from_value(lookup(value, "id")),
            name: string_at(value, "name"),
        }
    }
}

fn parse_text_content(content: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(content).ok()?;
    match parsed.get("text").and_then(Value::as_str) {
        Some(text) if !text.is_empty() => Some(text.to_string()),
        _ => None,
    }
}
