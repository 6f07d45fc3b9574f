pub mod builtin;
pub mod dispatcher;
pub mod registry;
pub mod request;
pub mod source;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;

use crate::lark::api::ApiClient;
use crate::lark::event::{NormalizedEvent, ReceiveMessage};
use crate::lark::user::UserDirectory;
use crate::store::ConfigStore;

pub use request::PathRequest;

/// What a plugin is for. Decides which routing table it can land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Subscribes to one event type; may also own a path.
    EventHandler,
    /// Only initialized; provides services to other plugins.
    Utility,
    /// Owns an HTTP path for third-party callbacks.
    PathHandler,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::EventHandler => write!(f, "event"),
            PluginKind::Utility => write!(f, "utility"),
            PluginKind::PathHandler => write!(f, "path"),
        }
    }
}

/// Hooks a plugin implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Init,
    HandleEvent,
    HandlePath,
}

/// Static metadata every plugin exposes. Checked once at registration.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub kind: PluginKind,
    /// Event type subscribed to (event handlers).
    pub event: Option<String>,
    /// Owned HTTP path (path handlers, optionally event handlers).
    pub path: Option<String>,
    /// Higher runs first.
    pub weight: i32,
    pub hooks: Vec<Hook>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, kind: PluginKind) -> Self {
        Self {
            name: name.into(),
            kind,
            event: None,
            path: None,
            weight: 0,
            hooks: Vec::new(),
        }
    }

    pub fn on_event(mut self, event_type: impl Into<String>) -> Self {
        self.event = Some(event_type.into());
        self
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn hooks(mut self, hooks: &[Hook]) -> Self {
        self.hooks = hooks.to_vec();
        self
    }

    pub fn has_hook(&self, hook: Hook) -> bool {
        self.hooks.contains(&hook)
    }
}

/// What an event handler receives.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    /// `im.message.receive_v1`, already parsed and with the sender resolved.
    Message(ReceiveMessage),
    Other(NormalizedEvent),
}

impl PluginEvent {
    pub fn event(&self) -> &NormalizedEvent {
        match self {
            PluginEvent::Message(m) => &m.event,
            PluginEvent::Other(e) => e,
        }
    }

    pub fn as_message(&self) -> Option<&ReceiveMessage> {
        match self {
            PluginEvent::Message(m) => Some(m),
            PluginEvent::Other(_) => None,
        }
    }
}

/// A unit of bot behavior. Only the hooks listed in the descriptor are ever
/// called; the defaults are never reached for undeclared hooks.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    async fn init(&self, _tools: &PluginTools) -> Result<()> {
        Ok(())
    }

    /// Return `true` to claim the event and stop lower-weight plugins from
    /// seeing it.
    async fn handle_event(&self, _event: &PluginEvent, _tools: &PluginTools) -> Result<bool> {
        Ok(false)
    }

    async fn handle_path(&self, _request: &PathRequest, _tools: &PluginTools) -> Result<()> {
        Ok(())
    }
}

/// Everything a plugin may reach: the platform API (and through it the token
/// cache), the config store and the user directory. Plugins log with
/// `tracing`; each hook runs inside a `plugin{name=..}` span.
pub struct PluginTools {
    pub api: Arc<ApiClient>,
    pub store: Arc<ConfigStore>,
    pub users: Arc<UserDirectory>,
    pub self_open_id: Option<String>,
    services: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl PluginTools {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<ConfigStore>,
        users: Arc<UserDirectory>,
        self_open_id: Option<String>,
    ) -> Self {
        Self {
            api,
            store,
            users,
            self_open_id,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Share one instance of `T` with every plugin. Replaces any previous
    /// instance of the same type.
    pub fn provide<T: Any + Send + Sync>(&self, service: Arc<T>) {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<T>(), service);
    }

    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|s| s.downcast::<T>().ok())
    }
}

/// Run a hook, turning a panic into an error so it stays contained to the
/// plugin.
pub(crate) async fn guarded<F, T>(hook: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("panicked: {}", msg))
        }
    }
}
