use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::topics::{ReceiveType, TopicManager, TopicSubscriber};
use crate::lark::event::{EventType, ReceiveMessage};
use crate::lark::message::RenderMessage;
use crate::plugin::{Hook, Plugin, PluginDescriptor, PluginEvent, PluginKind, PluginTools};

const HELP: &str = "Commands:\n\
/help - show this message\n\
/topics - list topics\n\
/subscribe <topic> - subscribe this chat to a topic\n\
/unsubscribe <topic> - stop receiving a topic";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Topics,
    Subscribe(String),
    Unsubscribe(String),
    Unknown(String),
}

impl Command {
    /// Parse the text of a message after mention placeholders are removed.
    /// `None` when the text is not a slash command.
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?.to_lowercase();
        let arg = parts.next().map(str::to_string);

        Some(match (name.as_str(), arg) {
            ("help", _) => Command::Help,
            ("topics", _) => Command::Topics,
            ("subscribe", Some(topic)) => Command::Subscribe(topic),
            ("unsubscribe", Some(topic)) => Command::Unsubscribe(topic),
            _ => Command::Unknown(name.clone()),
        })
    }
}

/// Text with every `@_user_N` mention key stripped.
fn strip_mentions(message: &ReceiveMessage, text: &str) -> String {
    message
        .mentions
        .iter()
        .fold(text.to_string(), |acc, m| acc.replace(&m.key, ""))
}

/// Lowest-priority handler: answers slash commands and claims them.
pub struct CommandPlugin {
    descriptor: PluginDescriptor,
}

impl CommandPlugin {
    pub const UNIT: &'static str = "command";

    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("Command Handler", PluginKind::EventHandler)
                .on_event(EventType::MessageReceive)
                .weight(0)
                .hooks(&[Hook::HandleEvent]),
        }
    }

    fn subscriber(message: &ReceiveMessage) -> Option<TopicSubscriber> {
        let name = message
            .sender_info
            .as_ref()
            .map(|i| i.name.clone())
            .unwrap_or_default();
        if message.is_group() {
            return Some(TopicSubscriber {
                id: message.chat_id.clone(),
                receive_type: ReceiveType::Group,
                name,
            });
        }
        message.sender_open_id().map(|id| TopicSubscriber {
            id: id.to_string(),
            receive_type: ReceiveType::User,
            name,
        })
    }

    fn execute(
        command: &Command,
        message: &ReceiveMessage,
        topics: Option<&TopicManager>,
    ) -> Result<String> {
        let reply = match (command, topics) {
            (Command::Help, _) => HELP.to_string(),
            (Command::Unknown(name), _) => format!("Unknown command /{}, try /help", name),
            (_, None) => "Topics are not available right now".to_string(),
            (Command::Topics, Some(topics)) => {
                let names = topics.topics();
                if names.is_empty() {
                    "No topics yet".to_string()
                } else {
                    format!("Topics:\n{}", names.join("\n"))
                }
            }
            (Command::Subscribe(topic), Some(topics)) => match Self::subscriber(message) {
                Some(subscriber) => {
                    if topics.add_subscriber(topic, subscriber)? {
                        format!("Subscribed to {}", topic)
                    } else {
                        format!("Already subscribed to {}", topic)
                    }
                }
                None => "Cannot tell who is subscribing".to_string(),
            },
            (Command::Unsubscribe(topic), Some(topics)) => match Self::subscriber(message) {
                Some(subscriber) if topics.remove_subscriber(topic, &subscriber.id)? => {
                    format!("Unsubscribed from {}", topic)
                }
                _ => format!("Not subscribed to {}", topic),
            },
        };
        Ok(reply)
    }
}

impl Default for CommandPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for CommandPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, event: &PluginEvent, tools: &PluginTools) -> Result<bool> {
        let Some(message) = event.as_message() else {
            return Ok(false);
        };
        let Some(text) = message.text.as_deref() else {
            return Ok(false);
        };
        // In groups only commands addressed to the bot count.
        if message.is_group() && !message.at_me(tools.self_open_id.as_deref()) {
            return Ok(false);
        }
        let Some(command) = Command::parse(&strip_mentions(message, text)) else {
            return Ok(false);
        };

        debug!(message_id = %message.message_id, "Command {:?}", command);
        let topics = tools.service::<TopicManager>();
        let reply: RenderMessage =
            RenderMessage::text(Self::execute(&command, message, topics.as_deref())?).into();
        tools.api.reply_message(&message.message_id, &reply).await?;
        info!(message_id = %message.message_id, "Replied to command");
        Ok(true)
    }
}
