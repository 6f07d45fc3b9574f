use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::topics::TopicManager;
use crate::lark::event::EventType;
use crate::lark::message::{PostMessage, RenderMessage};
use crate::plugin::{
    Hook, PathRequest, Plugin, PluginDescriptor, PluginEvent, PluginKind, PluginTools,
};

pub const EXAMPLE_PATH: &str = "/plugin/example";

/// Reference plugin: watches messages and relays third-party callbacks on
/// [`EXAMPLE_PATH`] into chat.
///
/// A callback with `text` is delivered to the first target present, in
/// order: `topic` (every subscriber), `chat_id`, `open_id`. With `link` the
/// message becomes a post titled `text`.
pub struct ExamplePlugin {
    descriptor: PluginDescriptor,
}

impl ExamplePlugin {
    pub const UNIT: &'static str = "example";

    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("Plugin Example", PluginKind::EventHandler)
                .on_event(EventType::MessageReceive)
                .at_path(EXAMPLE_PATH)
                .weight(500)
                .hooks(&[Hook::Init, Hook::HandleEvent, Hook::HandlePath]),
        }
    }
}

impl Default for ExamplePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ExamplePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn init(&self, _tools: &PluginTools) -> Result<()> {
        info!("Example plugin listening on {}", EXAMPLE_PATH);
        Ok(())
    }

    async fn handle_event(&self, event: &PluginEvent, _tools: &PluginTools) -> Result<bool> {
        if let Some(message) = event.as_message() {
            debug!(message_id = %message.message_id, chat_id = %message.chat_id, "Seen message");
        }
        Ok(false)
    }

    async fn handle_path(&self, request: &PathRequest, tools: &PluginTools) -> Result<()> {
        let Some(text) = request.param("text") else {
            warn!(method = %request.method, "Callback without text, ignoring");
            return Ok(());
        };
        let msg: RenderMessage = match request.param("link") {
            Some(link) => RenderMessage::post()
                .title(text)
                .line(vec![PostMessage::link_item(link, None)])
                .into(),
            None => RenderMessage::text(text).into(),
        };

        if let Some(topic) = request.param("topic") {
            let topics = tools
                .service::<TopicManager>()
                .ok_or_else(|| anyhow::anyhow!("topic service is not loaded"))?;
            topics.publish(&tools.api, topic, &msg).await;
        } else if let Some(chat_id) = request.param("chat_id") {
            tools.api.send_message_with_chat_id(chat_id, &msg).await?;
        } else if let Some(open_id) = request.param("open_id") {
            tools.api.send_message_with_open_id(open_id, &msg).await?;
        } else {
            warn!("Callback names no topic, chat_id or open_id");
        }
        Ok(())
    }
}
