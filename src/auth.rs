//! Caller identity for the association endpoints.

use crate::error::ApiError;
use crate::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
}

/// Resolves a request to a session, or nothing for anonymous callers.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Session>;
}

/// Static bearer tokens mapped to user ids.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    tokens: HashMap<String, String>,
}

impl TokenAuth {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl AuthProvider for TokenAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Session> {
        let token = bearer_token(headers)?;
        self.tokens
            .get(token)
            .filter(|user_id| !user_id.is_empty())
            .map(|user_id| Session {
                user_id: user_id.clone(),
            })
    }
}

/// Extractor that rejects with 401 before any other input is looked at.
/// Handlers must list it first.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Session);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        match state.auth.authenticate(&parts.headers) {
            Some(session) => Ok(AuthUser(session)),
            None => {
                log::debug!("Rejected unauthenticated request to {}", parts.uri.path());
                Err(ApiError::Unauthorized)
            }
        }
    }
}
