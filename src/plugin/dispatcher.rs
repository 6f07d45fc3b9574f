use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};

use super::registry::PluginRegistry;
use super::{guarded, PathRequest, PluginEvent, PluginTools};
use crate::error::PluginError;
use crate::lark::event::{EventType, NormalizedEvent, ReceiveMessage};
use crate::lark::user::UserHint;

/// Walks the routing tables for validated events and path callbacks.
///
/// Work is spawned onto tokio and bounded by a semaphore so the webhook can
/// answer before any plugin runs. A plugin that never returns keeps its
/// permit forever.
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    workers: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>, workers: usize) -> Self {
        Self {
            registry,
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    fn tools(&self) -> &PluginTools {
        self.registry.tools()
    }

    /// Offer `event` to its handlers in weight order. Returns the name of the
    /// plugin that claimed it, if any.
    pub async fn dispatch_event(&self, event: NormalizedEvent) -> Option<String> {
        let tables = self.registry.snapshot();
        let plugins = tables.for_event(event.event_type());
        if plugins.is_empty() {
            debug!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                "No plugin subscribed"
            );
            return None;
        }

        let payload = self.prepare(event).await;
        let event_id = payload.event().event_id().to_string();

        for plugin in plugins {
            let name = &plugin.descriptor().name;
            let span = info_span!("plugin", name = %name, event_id = %event_id);
            match guarded(plugin.handle_event(&payload, self.tools()))
                .instrument(span)
                .await
            {
                Ok(true) => {
                    debug!(event_id = %event_id, "Event handled by '{}'", name);
                    return Some(name.clone());
                }
                Ok(false) => {}
                Err(reason) => error!(
                    event_id = %event_id,
                    "{}",
                    PluginError::Runtime {
                        plugin: name.clone(),
                        reason,
                    }
                ),
            }
        }
        None
    }

    /// Message pushes get parsed and their sender resolved before any plugin
    /// sees them.
    async fn prepare(&self, event: NormalizedEvent) -> PluginEvent {
        if event.kind() != Some(EventType::MessageReceive) {
            return PluginEvent::Other(event);
        }

        let message = ReceiveMessage::from_event(event);
        let sender = match message.sender_open_id() {
            Some(open_id) => {
                let hint = UserHint {
                    union_id: message.sender.union_id.clone(),
                    name: None,
                };
                self.tools().users.find(open_id, hint).await
            }
            None => None,
        };
        PluginEvent::Message(message.with_sender_info(sender))
    }

    /// Run the owner of `request.path`. Returns `false` when nobody owns it;
    /// handler failures are logged, never returned.
    pub async fn dispatch_path(&self, request: PathRequest) -> bool {
        let Some(plugin) = self.registry.snapshot().for_path(&request.path).cloned() else {
            return false;
        };

        let name = &plugin.descriptor().name;
        let span = info_span!("plugin", name = %name, path = %request.path);
        if let Err(reason) = guarded(plugin.handle_path(&request, self.tools()))
            .instrument(span)
            .await
        {
            error!(
                path = %request.path,
                "{}",
                PluginError::Runtime {
                    plugin: name.clone(),
                    reason,
                }
            );
        }
        true
    }

    /// Queue an event on the worker pool, rescanning plugins first if the
    /// debounce window has passed.
    pub fn spawn_event(self: &Arc<Self>, event: NormalizedEvent) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = this.workers.clone().acquire_owned().await else {
                return;
            };
            this.refresh().await;
            this.dispatch_event(event).await;
        })
    }

    pub fn spawn_path(self: &Arc<Self>, request: PathRequest) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = this.workers.clone().acquire_owned().await else {
                return;
            };
            this.refresh().await;
            this.dispatch_path(request).await;
        })
    }

    async fn refresh(&self) {
        if let Err(e) = self.registry.refresh().await {
            warn!("Plugin rescan failed, keeping previous routing: {:#}", e);
        }
    }
}
