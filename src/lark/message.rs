//! Outbound message payloads: plain text and rich "post".

use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum RenderMessage {
    Text(TextMessage),
    Post(PostMessage),
}

impl RenderMessage {
    pub fn text(content: impl Into<String>) -> TextMessage {
        TextMessage {
            content: content.into(),
        }
    }

    pub fn post() -> PostMessage {
        PostMessage::default()
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            RenderMessage::Text(_) => "text",
            RenderMessage::Post(_) => "post",
        }
    }

    /// The JSON-encoded `content` string the API expects.
    pub fn content(&self) -> String {
        let content = match self {
            RenderMessage::Text(t) => json!({ "text": t.content }),
            RenderMessage::Post(p) => json!({
                "zh_cn": { "title": p.title, "content": p.lines }
            }),
        };
        content.to_string()
    }

    /// Request body for send (with a receiver) or reply (without).
    pub fn to_body(&self, receive_id: Option<&str>) -> Value {
        let mut body = json!({
            "msg_type": self.msg_type(),
            "content": self.content(),
        });
        if let Some(id) = receive_id {
            body["receive_id"] = Value::String(id.to_string());
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    content: String,
}

impl TextMessage {
    pub fn at_user(mut self, user_id: &str, user_name: &str) -> Self {
        self.content = format!(
            "<at user_id=\"{}\">{}</at>{}",
            user_id, user_name, self.content
        );
        self
    }

    pub fn at_all(mut self) -> Self {
        self.content = format!("<at user_id=\"all\">所有人</at>{}", self.content);
        self
    }
}

impl From<TextMessage> for RenderMessage {
    fn from(t: TextMessage) -> Self {
        RenderMessage::Text(t)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostMessage {
    title: String,
    lines: Vec<Vec<Value>>,
}

impl PostMessage {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Append a line and return its 1-based index.
    pub fn push_line(&mut self, items: Vec<Value>) -> usize {
        self.lines.push(items);
        self.lines.len()
    }

    /// Replace line `index` (1-based). `len + 1` appends.
    pub fn set_line(&mut self, index: usize, items: Vec<Value>) -> anyhow::Result<usize> {
        match index {
            0 => anyhow::bail!("line index is 1-based"),
            i if i <= self.lines.len() => self.lines[i - 1] = items,
            i if i == self.lines.len() + 1 => self.lines.push(items),
            i => anyhow::bail!("No line row {} (post has {} lines)", i, self.lines.len()),
        }
        Ok(index)
    }

    pub fn line(mut self, items: Vec<Value>) -> Self {
        self.push_line(items);
        self
    }

    pub fn text_item(text: &str) -> Value {
        json!({ "tag": "text", "text": text })
    }

    pub fn link_item(href: &str, text: Option<&str>) -> Value {
        json!({ "tag": "a", "href": href, "text": text.unwrap_or(href) })
    }

    pub fn at_item(user_id: &str, user_name: &str) -> Value {
        json!({ "tag": "at", "user_id": user_id, "user_name": user_name })
    }
}

impl From<PostMessage> for RenderMessage {
    fn from(p: PostMessage) -> Self {
        RenderMessage::Post(p)
    }
}
