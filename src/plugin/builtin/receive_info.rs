use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::lark::event::{EventType, ReceiveMessage};
use crate::lark::user::UserHint;
use crate::plugin::{Hook, Plugin, PluginDescriptor, PluginEvent, PluginKind, PluginTools};

/// Logs every group message it sees, with the mentioned users resolved.
/// Never claims the event.
pub struct ReceiveInfoPlugin {
    descriptor: PluginDescriptor,
}

impl ReceiveInfoPlugin {
    pub const UNIT: &'static str = "receive-info";

    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("ReceiveInfo", PluginKind::EventHandler)
                .on_event(EventType::MessageReceive)
                .weight(1000)
                .hooks(&[Hook::HandleEvent]),
        }
    }

    async fn log_message(message: &ReceiveMessage, tools: &PluginTools) {
        let head = format!("+++++++++++++++ [{}] +++++++++++++++", message.message_id);
        info!("{}", head);
        info!("GROUP_ID     >>> {}", message.chat_id);
        match &message.sender_info {
            Some(sender) => info!(
                "SENDER       >>> {}[{}][{}]{}",
                sender.open_id,
                sender.name,
                sender.description,
                if sender.is_verified() { "" } else { " (unverified)" }
            ),
            None => info!(
                "SENDER       >>> {}",
                message.sender_open_id().unwrap_or("<unknown>")
            ),
        }
        info!("AT_ME        >>> {}", message.at_me(tools.self_open_id.as_deref()));
        info!("SENDER_TYPE  >>> {}", message.sender_type);
        info!("MSG_TYPE     >>> {}", message.message_type);
        match &message.text {
            Some(text) => info!("TEXT_CONTENT >>> {}", text),
            None => info!("MSG_CONTENT  >>> {}", message.content),
        }

        for mention in &message.mentions {
            let Some(open_id) = mention.id.open_id.as_deref() else {
                continue;
            };
            match tools.users.find(open_id, UserHint::named(&mention.name)).await {
                Some(user) => info!(
                    "    mention  >>> {}[{}][{}]",
                    user.open_id, user.name, user.description
                ),
                None => info!("    mention  >>> {}[{}]", open_id, mention.name),
            }
        }
        info!("{}", "+".repeat(head.len()));
    }
}

impl Default for ReceiveInfoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ReceiveInfoPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, event: &PluginEvent, tools: &PluginTools) -> Result<bool> {
        if let Some(message) = event.as_message().filter(|m| m.is_group()) {
            Self::log_message(message, tools).await;
        }
        Ok(false)
    }
}
