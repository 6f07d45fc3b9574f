//! Where the registry finds its plugins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::Plugin;

#[async_trait]
pub trait PluginSource: Send + Sync {
    /// Produce fresh plugin instances for one registry refresh.
    async fn discover(&self) -> Result<Vec<Arc<dyn Plugin>>>;
}

type Factory = Box<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Plugins compiled into the binary, by unit name.
#[derive(Default)]
pub struct Catalog {
    entries: Vec<(String, Factory)>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, unit: &str, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.entries.push((unit.to_string(), Box::new(factory)));
        self
    }

    pub fn create(&self, unit: &str) -> Option<Arc<dyn Plugin>> {
        self.entries
            .iter()
            .find(|(name, _)| name == unit)
            .map(|(_, factory)| factory())
    }

    pub fn units(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PluginSource for Catalog {
    async fn discover(&self) -> Result<Vec<Arc<dyn Plugin>>> {
        Ok(self.entries.iter().map(|(_, factory)| factory()).collect())
    }
}

/// A `*.toml` file in the plugin directory enabling one catalog unit.
///
/// ```toml
/// unit = "receive-info"
/// enabled = true
/// ```
#[derive(Debug, Deserialize)]
struct PluginManifest {
    unit: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Enables catalog units by manifest files in a directory. Without the
/// directory every catalog unit is enabled.
pub struct DirectorySource {
    dir: PathBuf,
    catalog: Catalog,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, catalog: Catalog) -> Self {
        Self {
            dir: dir.into(),
            catalog,
        }
    }
}

#[async_trait]
impl PluginSource for DirectorySource {
    async fn discover(&self) -> Result<Vec<Arc<dyn Plugin>>> {
        if !self.dir.exists() {
            info!(
                "Plugin directory not found: {}, enabling all {} built-in plugins",
                self.dir.display(),
                self.catalog.len()
            );
            return self.catalog.discover().await;
        }

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read plugin directory: {}", self.dir.display()))?;

        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                manifests.push(path);
            }
        }
        manifests.sort();

        let mut seen = HashSet::new();
        let mut plugins = Vec::new();
        for path in manifests {
            let manifest = match load_manifest(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping plugin manifest {}: {:#}", path.display(), e);
                    continue;
                }
            };
            if !manifest.enabled {
                info!("Plugin unit '{}' is disabled by {}", manifest.unit, path.display());
                continue;
            }
            if !seen.insert(manifest.unit.clone()) {
                warn!(
                    "Plugin unit '{}' enabled more than once, ignoring {}",
                    manifest.unit,
                    path.display()
                );
                continue;
            }
            match self.catalog.create(&manifest.unit) {
                Some(plugin) => plugins.push(plugin),
                None => warn!(
                    "Unknown plugin unit '{}' in {} (available: {:?})",
                    manifest.unit,
                    path.display(),
                    self.catalog.units()
                ),
            }
        }

        Ok(plugins)
    }
}

async fn load_manifest(path: &Path) -> Result<PluginManifest> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    toml::from_str(&content).context("Invalid manifest")
}
