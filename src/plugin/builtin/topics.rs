use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::lark::api::ApiClient;
use crate::lark::message::RenderMessage;
use crate::plugin::{Hook, Plugin, PluginDescriptor, PluginKind, PluginTools};
use crate::store::ConfigStore;

pub const TOPIC_DATA_KEY: &str = "topic_data";

/// How a subscriber id is addressed when publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveType {
    /// `id` is an open id.
    User,
    /// `id` is a chat id.
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscriber {
    pub id: String,
    #[serde(rename = "type")]
    pub receive_type: ReceiveType,
    #[serde(default)]
    pub name: String,
}

type Topics = BTreeMap<String, Vec<TopicSubscriber>>;

/// Named topics and their subscribers, persisted in the config store.
/// Shared with other plugins through [`PluginTools::service`].
pub struct TopicManager {
    store: Arc<ConfigStore>,
    // Serializes read-modify-write cycles on the store key.
    write: Mutex<()>,
}

impl TopicManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            write: Mutex::new(()),
        }
    }

    /// Splits the stored document into topics and entries that are not
    /// subscriber lists. The latter are written back untouched.
    fn read(&self) -> Result<(Topics, Map<String, Value>)> {
        let entries = match self.store.get(TOPIC_DATA_KEY) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(entries)) => entries,
            Some(other) => bail!("{} is not an object: {}", TOPIC_DATA_KEY, other),
        };

        let mut topics = Topics::new();
        let mut foreign = Map::new();
        for (name, value) in entries {
            match serde_json::from_value::<Vec<TopicSubscriber>>(value.clone()) {
                Ok(subscribers) => {
                    topics.insert(name, subscribers);
                }
                Err(e) => {
                    debug!(entry = %name, "Not a topic: {}", e);
                    foreign.insert(name, value);
                }
            }
        }
        Ok((topics, foreign))
    }

    fn load(&self) -> Topics {
        match self.read() {
            Ok((topics, _)) => topics,
            Err(e) => {
                warn!("Ignoring topic data: {}", e);
                Topics::new()
            }
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Topics) -> R) -> Result<R> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let (mut topics, mut document) = self.read()?;
        let result = f(&mut topics);
        for (name, subscribers) in topics {
            document.insert(name, serde_json::to_value(subscribers)?);
        }
        self.store.put(TOPIC_DATA_KEY, Value::Object(document))?;
        Ok(result)
    }

    pub fn topics(&self) -> Vec<String> {
        self.load().into_keys().collect()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.load().contains_key(topic)
    }

    pub fn subscribers(&self, topic: &str) -> Vec<TopicSubscriber> {
        self.load().remove(topic).unwrap_or_default()
    }

    /// Returns `false` if the topic already existed.
    pub fn create_topic(&self, topic: &str) -> Result<bool> {
        self.update(|topics| {
            if topics.contains_key(topic) {
                return false;
            }
            topics.insert(topic.to_string(), Vec::new());
            true
        })
    }

    /// Subscribe, creating the topic on first use. Returns `false` if `id`
    /// was already subscribed.
    pub fn add_subscriber(&self, topic: &str, subscriber: TopicSubscriber) -> Result<bool> {
        self.update(|topics| {
            let subscribers = topics.entry(topic.to_string()).or_default();
            if subscribers.iter().any(|s| s.id == subscriber.id) {
                return false;
            }
            subscribers.push(subscriber);
            true
        })
    }

    pub fn remove_subscriber(&self, topic: &str, id: &str) -> Result<bool> {
        self.update(|topics| match topics.get_mut(topic) {
            Some(subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|s| s.id != id);
                subscribers.len() != before
            }
            None => false,
        })
    }

    /// Send `msg` to every subscriber of `topic`. Returns how many sends
    /// succeeded; failures are logged and skipped.
    pub async fn publish(&self, api: &ApiClient, topic: &str, msg: &RenderMessage) -> usize {
        let mut delivered = 0;
        for subscriber in self.subscribers(topic) {
            let result = match subscriber.receive_type {
                ReceiveType::User => api.send_message_with_open_id(&subscriber.id, msg).await,
                ReceiveType::Group => api.send_message_with_chat_id(&subscriber.id, msg).await,
            };
            match result {
                Ok(_) => delivered += 1,
                Err(e) => warn!(topic, subscriber = %subscriber.id, "Publish failed: {}", e),
            }
        }
        info!(topic, delivered, "Published to topic");
        delivered
    }
}

/// Utility unit that owns the shared [`TopicManager`].
pub struct TopicsPlugin {
    descriptor: PluginDescriptor,
}

impl TopicsPlugin {
    pub const UNIT: &'static str = "topics";

    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("Topic Manager", PluginKind::Utility)
                .weight(1000)
                .hooks(&[Hook::Init]),
        }
    }
}

impl Default for TopicsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for TopicsPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn init(&self, tools: &PluginTools) -> Result<()> {
        // Rescans keep the live manager so its write lock stays the only one.
        if tools.service::<TopicManager>().is_some() {
            debug!("Topic manager already provided");
            return Ok(());
        }
        if tools.store.get(TOPIC_DATA_KEY).is_none() {
            tools.store.put(TOPIC_DATA_KEY, Topics::new())?;
        }
        let manager = TopicManager::new(tools.store.clone());
        info!("Topic manager ready with {} topics", manager.topics().len());
        tools.provide(Arc::new(manager));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::tests::{test_tools, tools_against};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user(id: &str) -> TopicSubscriber {
        TopicSubscriber {
            id: id.to_string(),
            receive_type: ReceiveType::User,
            name: String::new(),
        }
    }

    #[tokio::test]
    async fn test_init_provides_shared_manager() {
        let dir = tempfile::tempdir().unwrap();
        let tools = test_tools(dir.path());

        TopicsPlugin::new().init(&tools).await.unwrap();
        assert_eq!(tools.store.get(TOPIC_DATA_KEY), Some(json!({})));

        let manager = tools.service::<TopicManager>().unwrap();
        assert!(manager.topics().is_empty());
    }

    #[tokio::test]
    async fn test_reinit_keeps_the_provided_manager() {
        let dir = tempfile::tempdir().unwrap();
        let tools = test_tools(dir.path());
        let plugin = TopicsPlugin::new();

        plugin.init(&tools).await.unwrap();
        let first = tools.service::<TopicManager>().unwrap();
        plugin.init(&tools).await.unwrap();
        let second = tools.service::<TopicManager>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_entries_that_are_not_topics_survive_updates() {
        let dir = tempfile::tempdir().unwrap();
        let tools = test_tools(dir.path());
        tools
            .store
            .put(
                TOPIC_DATA_KEY,
                json!({
                    "__init__": "2024-01-01 00:00:00",
                    "deploys": [{"id": "oc_1", "type": "group", "name": "team"}]
                }),
            )
            .unwrap();
        let manager = TopicManager::new(tools.store.clone());

        assert_eq!(manager.topics(), ["deploys"]);
        assert!(manager.add_subscriber("alerts", user("ou_x")).unwrap());

        let stored = tools.store.get(TOPIC_DATA_KEY).unwrap();
        assert_eq!(stored["__init__"], json!("2024-01-01 00:00:00"));
        assert_eq!(stored["deploys"][0]["id"], json!("oc_1"));
        assert_eq!(stored["alerts"][0]["id"], json!("ou_x"));
        assert_eq!(manager.topics(), ["alerts", "deploys"]);
    }

    #[test]
    fn test_non_object_topic_data_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let tools = test_tools(dir.path());
        tools.store.put(TOPIC_DATA_KEY, "corrupt").unwrap();
        let manager = TopicManager::new(tools.store.clone());

        assert!(manager.topics().is_empty());
        assert!(manager.create_topic("deploys").is_err());
        assert_eq!(tools.store.get(TOPIC_DATA_KEY), Some(json!("corrupt")));
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let dir = tempfile::tempdir().unwrap();
        let tools = test_tools(dir.path());
        let manager = TopicManager::new(tools.store.clone());

        assert!(manager.create_topic("deploys").unwrap());
        assert!(!manager.create_topic("deploys").unwrap());
        assert!(manager.add_subscriber("deploys", user("ou_a")).unwrap());
        assert!(!manager.add_subscriber("deploys", user("ou_a")).unwrap());
        assert!(manager.add_subscriber("alerts", user("ou_b")).unwrap());

        assert_eq!(manager.topics(), ["alerts", "deploys"]);
        assert!(manager.has_topic("alerts"));
        assert_eq!(manager.subscribers("deploys"), [user("ou_a")]);

        assert!(manager.remove_subscriber("deploys", "ou_a").unwrap());
        assert!(!manager.remove_subscriber("deploys", "ou_a").unwrap());
        assert!(!manager.remove_subscriber("missing", "ou_a").unwrap());

        let stored = tools.store.get(TOPIC_DATA_KEY).unwrap();
        assert_eq!(stored["alerts"][0], json!({"id": "ou_b", "type": "user", "name": ""}));
    }

    #[tokio::test]
    async fn test_publish_addresses_by_receive_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/open-apis/im/v1/messages"))
            .and(query_param("receive_id_type", "open_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/open-apis/im/v1/messages"))
            .and(query_param("receive_id_type", "chat_id"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"code": 230002, "msg": "no"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tools = tools_against(dir.path(), &server.uri());
        let manager = TopicManager::new(tools.store.clone());
        manager.add_subscriber("news", user("ou_a")).unwrap();
        manager
            .add_subscriber(
                "news",
                TopicSubscriber {
                    id: "oc_1".to_string(),
                    receive_type: ReceiveType::Group,
                    name: "team".to_string(),
                },
            )
            .unwrap();

        let msg: RenderMessage = RenderMessage::text("hello").into();
        assert_eq!(manager.publish(&tools.api, "news", &msg).await, 1);
    }
}
