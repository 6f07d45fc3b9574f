use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub lark: LarkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LarkConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub verification_token: String,
    /// Event payload encryption key. Unset means pushes arrive in plain text.
    #[serde(default)]
    pub encrypt_key: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    /// The bot's own open id, used to detect mentions of the bot.
    #[serde(default)]
    pub self_open_id: Option<String>,
}

impl Default for LarkConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            verification_token: String::new(),
            encrypt_key: None,
            host: default_host(),
            self_open_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PluginsConfig {
    /// Directory of `*.toml` plugin manifests. When it does not exist every
    /// compiled-in plugin is enabled.
    #[serde(default = "default_plugins_dir")]
    pub directory: PathBuf,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugins_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Maximum number of events/requests dispatched concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_host() -> String {
    "https://open.feishu.cn".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:2020".to_string()
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_workers() -> usize {
    16
}

fn default_store_path() -> PathBuf {
    PathBuf::from("store.json")
}

impl Config {
    /// Load the TOML file at `path` (if present), then apply environment
    /// overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)?
        } else {
            Self::parse("")?
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.normalize();
        Ok(config)
    }

    /// Environment variables win over the file. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APP_ID") {
            self.lark.app_id = v;
        }
        if let Some(v) = lookup("APP_SECRET") {
            self.lark.app_secret = v;
        }
        if let Some(v) = lookup("VERIFICATION_TOKEN") {
            self.lark.verification_token = v;
        }
        if let Some(v) = lookup("ENCRYPT_KEY") {
            self.lark.encrypt_key = Some(v);
        }
        if let Some(v) = lookup("LARK_HOST") {
            self.lark.host = v;
        }
        if let Some(v) = lookup("SELF_OPEN_ID") {
            self.lark.self_open_id = Some(v);
        }
        if let Some(v) = lookup("CONFIG_FILE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        self.normalize();
    }

    // An empty key in either source means "not configured".
    fn normalize(&mut self) {
        if self.lark.encrypt_key.as_deref() == Some("") {
            self.lark.encrypt_key = None;
        }
        if self.lark.self_open_id.as_deref() == Some("") {
            self.lark.self_open_id = None;
        }
        self.lark.host = self.lark.host.trim_end_matches('/').to_string();
    }

    fn validate(&self) -> Result<()> {
        if self.lark.app_id.is_empty() {
            anyhow::bail!("lark.app_id (or APP_ID) must be set");
        }
        if self.lark.app_secret.is_empty() {
            anyhow::bail!("lark.app_secret (or APP_SECRET) must be set");
        }
        if self.lark.verification_token.is_empty() {
            anyhow::bail!("lark.verification_token (or VERIFICATION_TOKEN) must be set");
        }
        if self.dispatch.workers == 0 {
            anyhow::bail!("dispatch.workers must be at least 1");
        }
        Ok(())
    }
}
