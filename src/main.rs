mod config;
mod error;
mod lark;
mod plugin;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::lark::api::ApiClient;
use crate::lark::user::UserDirectory;
use crate::lark::validator::EventValidator;
use crate::plugin::builtin;
use crate::plugin::dispatcher::Dispatcher;
use crate::plugin::registry::PluginRegistry;
use crate::plugin::source::DirectorySource;
use crate::plugin::PluginTools;
use crate::server::AppState;
use crate::store::ConfigStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,larkbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  App ID: {}", config.lark.app_id);
    info!("  API host: {}", config.lark.host);
    info!("  Encrypted events: {}", config.lark.encrypt_key.is_some());
    info!("  Plugin directory: {}", config.plugins.directory.display());
    info!("  Dispatch workers: {}", config.dispatch.workers);

    // Shared plugin tools
    let api = Arc::new(ApiClient::new(&config.lark));
    let store = Arc::new(
        ConfigStore::open(&config.store.path)
            .with_context(|| format!("Failed to open store {}", config.store.path.display()))?,
    );
    let users = Arc::new(UserDirectory::new(api.clone()));
    let tools = Arc::new(PluginTools::new(
        api,
        store,
        users,
        config.lark.self_open_id.clone(),
    ));

    // Load plugins
    let source = DirectorySource::new(&config.plugins.directory, builtin::catalog());
    let registry = Arc::new(PluginRegistry::new(Box::new(source), tools));
    registry
        .force_refresh()
        .await
        .context("Failed to load plugins")?;

    let state = AppState {
        validator: Arc::new(EventValidator::new(
            config.lark.verification_token.clone(),
            config.lark.encrypt_key.clone(),
        )),
        dispatcher: Arc::new(Dispatcher::new(registry, config.dispatch.workers)),
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
    info!("Bot is listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
