pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod http_server;
pub mod local_storage;
pub mod models;
pub mod selection;
pub mod store;
pub mod sync;

use std::sync::Arc;

/// Shared handles for the HTTP layer
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn store::PdfStore>,
    pub auth: Arc<dyn auth::AuthProvider>,
}
