use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::source::PluginSource;
use super::{guarded, Hook, Plugin, PluginKind, PluginTools};
use crate::error::PluginError;
use crate::lark::event::EventType;

/// Minimum time between two non-forced rescans.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(60);

/// One immutable routing epoch. Replaced wholesale on refresh.
#[derive(Default)]
pub struct RoutingTables {
    events: HashMap<EventType, Vec<Arc<dyn Plugin>>>,
    paths: HashMap<String, Arc<dyn Plugin>>,
}

impl RoutingTables {
    /// Handlers for `event_type`, highest weight first.
    pub fn for_event(&self, event_type: &str) -> &[Arc<dyn Plugin>] {
        EventType::parse(event_type)
            .and_then(|t| self.events.get(&t))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn for_path(&self, path: &str) -> Option<&Arc<dyn Plugin>> {
        self.paths.get(path)
    }

    fn log_summary(&self) {
        for event_type in EventType::ALL {
            let Some(plugins) = self.events.get(&event_type) else {
                continue;
            };
            info!("Routing for {}:", event_type);
            for plugin in plugins {
                let d = plugin.descriptor();
                info!("  {:>6}  {}", d.weight, d.name);
            }
        }
        let mut paths: Vec<_> = self.paths.iter().collect();
        paths.sort_by(|a, b| a.0.cmp(b.0));
        for (path, plugin) in paths {
            info!("Path {} -> {}", path, plugin.descriptor().name);
        }
    }
}

/// Owns the routing tables and rebuilds them from a [`PluginSource`].
pub struct PluginRegistry {
    source: Box<dyn PluginSource>,
    tools: Arc<PluginTools>,
    tables: RwLock<Arc<RoutingTables>>,
    last_scan: Mutex<Option<Instant>>,
}

impl PluginRegistry {
    pub fn new(source: Box<dyn PluginSource>, tools: Arc<PluginTools>) -> Self {
        Self {
            source,
            tools,
            tables: RwLock::new(Arc::new(RoutingTables::default())),
            last_scan: Mutex::new(None),
        }
    }

    pub fn tools(&self) -> &Arc<PluginTools> {
        &self.tools
    }

    /// The current epoch. Holders keep seeing it even if a refresh swaps in
    /// a new one.
    pub fn snapshot(&self) -> Arc<RoutingTables> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn route_for_event(&self, event_type: &str) -> Vec<Arc<dyn Plugin>> {
        self.snapshot().for_event(event_type).to_vec()
    }

    pub fn route_for_path(&self, path: &str) -> Option<Arc<dyn Plugin>> {
        self.snapshot().for_path(path).cloned()
    }

    /// Rescan unless the last successful scan is under a minute old.
    /// Returns whether a scan happened.
    pub async fn refresh(&self) -> Result<bool> {
        self.refresh_at(Instant::now(), false).await
    }

    pub async fn force_refresh(&self) -> Result<()> {
        self.refresh_at(Instant::now(), true).await.map(|_| ())
    }

    pub(crate) async fn refresh_at(&self, now: Instant, force: bool) -> Result<bool> {
        // Held for the whole scan so concurrent callers queue and then hit
        // the debounce.
        let mut last_scan = self.last_scan.lock().await;
        if !force {
            if let Some(last) = *last_scan {
                if now.saturating_duration_since(last) < REFRESH_DEBOUNCE {
                    return Ok(false);
                }
            }
        }

        let plugins = self.source.discover().await?;
        debug!("Discovered {} plugin units", plugins.len());
        let tables = self.build(plugins).await;
        tables.log_summary();

        *self.tables.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(tables);
        *last_scan = Some(now);
        Ok(true)
    }

    async fn build(&self, mut plugins: Vec<Arc<dyn Plugin>>) -> RoutingTables {
        // Weight descending, then name ascending.
        plugins.sort_by(|a, b| {
            let (a, b) = (a.descriptor(), b.descriptor());
            b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name))
        });

        let mut tables = RoutingTables::default();
        let mut loaded = 0usize;

        for plugin in plugins {
            let d = plugin.descriptor();
            let span = info_span!("plugin", name = %d.name);

            if d.has_hook(Hook::Init) {
                if let Err(reason) = guarded(plugin.init(&self.tools)).instrument(span).await {
                    error!(
                        "{}",
                        PluginError::Init {
                            plugin: d.name.clone(),
                            reason,
                        }
                    );
                    continue;
                }
            }

            if d.kind == PluginKind::EventHandler {
                match d.event.as_deref().map(|e| (e, EventType::parse(e))) {
                    Some((_, Some(event_type))) if d.has_hook(Hook::HandleEvent) => {
                        tables
                            .events
                            .entry(event_type)
                            .or_default()
                            .push(plugin.clone());
                    }
                    Some((_, Some(_))) => {
                        warn!("Plugin '{}' subscribes to an event but has no handler", d.name)
                    }
                    Some((raw, None)) => {
                        warn!("Plugin '{}' subscribes to unknown event type '{}'", d.name, raw)
                    }
                    None => warn!("Event plugin '{}' declares no event type", d.name),
                }
            }

            if d.kind != PluginKind::Utility {
                if let Some(path) = d.path.as_ref().filter(|_| d.has_hook(Hook::HandlePath)) {
                    if let Some(previous) = tables.paths.insert(path.clone(), plugin.clone()) {
                        warn!(
                            "Path {} was owned by '{}', now by '{}'",
                            path,
                            previous.descriptor().name,
                            d.name
                        );
                    }
                }
            }

            debug!(kind = %d.kind, weight = d.weight, "Registered plugin '{}'", d.name);
            loaded += 1;
        }

        info!("Loaded {} plugins", loaded);
        tables
    }
}
