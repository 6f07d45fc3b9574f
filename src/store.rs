use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

/// Small key/value store persisted as one JSON document. Plugins keep their
/// settings and state here; bulky data belongs in its own file.
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<Map<String, Value>>,
}

impl ConfigStore {
    /// Open the store, creating an empty document if the file is missing.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
            std::fs::write(path, "{}")
                .with_context(|| format!("Failed to create store file: {}", path.display()))?;
        }

        let data = read_document(path)?;
        info!("Config store loaded from {} ({} keys)", path.display(), data.len());
        Ok(Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Typed read; `None` when missing or of a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Set `key`, write the file and reload it.
    pub fn put<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value).context("Failed to serialize store value")?;
        let mut data = self.write();
        let mut next = data.clone();
        next.insert(key.to_string(), value);
        *data = self.persist(&next)?;
        Ok(())
    }

    /// Remove `key`; returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut data = self.write();
        if !data.contains_key(key) {
            return Ok(false);
        }
        let mut next = data.clone();
        next.remove(key);
        *data = self.persist(&next)?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` and return the document as read back. The in-memory
    /// copy is only replaced by the caller once this succeeds.
    fn persist(&self, data: &Map<String, Value>) -> Result<Map<String, Value>> {
        let text = serde_json::to_string_pretty(data)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("Failed to write store file: {}", self.path.display()))?;
        read_document(&self.path)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Map<String, Value>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Map<String, Value>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn read_document(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read store file: {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(&text)
        .with_context(|| format!("Store file is not a JSON object: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let store = ConfigStore::open(&path).unwrap();

        assert!(store.get("missing").is_none());
        assert_eq!(store.get_or("missing", json!(5)), json!(5));

        store.put("greeting", "你好").unwrap();
        store.put("limits", json!({"max": 3})).unwrap();
        assert_eq!(store.get("greeting"), Some(json!("你好")));

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get("limits"), Some(json!({"max": 3})));

        assert!(store.remove("greeting").unwrap());
        assert!(!store.remove("greeting").unwrap());
        let reopened = ConfigStore::open(&path).unwrap();
        assert!(reopened.get("greeting").is_none());
    }

    #[test]
    fn test_failed_write_keeps_memory_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = ConfigStore::open(&path).unwrap();
        store.put("kept", 1).unwrap();

        // A directory in place of the file makes every write fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.put("lost", 2).is_err());
        assert!(store.get("lost").is_none());
        assert!(store.remove("kept").is_err());
        assert_eq!(store.get("kept"), Some(json!(1)));
    }

    #[test]
    fn test_get_as_typed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("s.json")).unwrap();
        store.put("ids", vec!["a", "b"]).unwrap();

        assert_eq!(
            store.get_as::<Vec<String>>("ids"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(store.get_as::<u32>("ids"), None);
    }

    #[test]
    fn test_empty_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "").unwrap();
        let store = ConfigStore::open(&path).unwrap();
        assert!(store.get("x").is_none());
    }

    #[test]
    fn test_non_object_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "[1,2]").unwrap();
        assert!(ConfigStore::open(&path).is_err());
    }
}
