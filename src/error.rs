use crate::models::ErrorBody;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub const INTERNAL: &str = "Internal server error";

/// Failures surfaced by the association endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad request: {0}")]
    BadRequest(&'static str),
    /// Rule violation reported by the store, passed through verbatim.
    #[error("{0}")]
    Domain(String),
    #[error(transparent)]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::Domain(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(message) => ApiError::Domain(message),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self {
            ApiError::Internal(e) => {
                log::error!("Unexpected failure handling PDF request: {:#}", e);
                INTERNAL.to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::BadRequest("chat ID is required").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Domain("PDF not found: x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(ApiError::Unauthorized.to_string(), "Unauthorized");
        assert_eq!(
            ApiError::BadRequest("chat ID is required").to_string(),
            "Bad request: chat ID is required"
        );
    }

    #[test]
    fn test_store_errors_split_into_domain_and_internal() {
        let domain: ApiError = StoreError::Domain("Chat not found: c".into()).into();
        assert!(matches!(domain, ApiError::Domain(ref m) if m == "Chat not found: c"));

        let internal: ApiError = StoreError::Poisoned.into();
        assert!(matches!(internal, ApiError::Internal(_)));
    }
}
