use anyhow::Context;
use chat_pdfs::auth::TokenAuth;
use chat_pdfs::config::AppConfig;
use chat_pdfs::store::SqliteStore;
use chat_pdfs::{http_server, AppState};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let server = config.server;

    log::info!("Database path: {:?}", server.db_path);

    if let Some(parent) = server.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = SqliteStore::open(&server.db_path).context("Failed to open association store")?;

    if server.api_tokens.is_empty() {
        log::warn!("No API tokens configured; every request will be rejected as unauthorized");
    }

    let state = Arc::new(AppState {
        store: Arc::new(store),
        auth: Arc::new(TokenAuth::new(server.api_tokens.clone())),
    });

    log::info!("chat-pdfs initialized successfully");

    http_server::start_server(&server.bind_addr(), state).await
}
