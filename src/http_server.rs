use axum::{
    body::Bytes,
    extract::{Query, State},
    http::Uri,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::{
    CatalogResponse, ChatPdfsResponse, HealthResponse, PdfDescriptor, PdfIdBody, SetPdfsBody,
    SuccessResponse,
};
use crate::AppState;

const CHAT_ID_REQUIRED: &str = "chat ID is required";
const CHAT_AND_PDF_REQUIRED: &str = "chat ID and PDF ID are required";
const CHAT_AND_PDF_LIST_REQUIRED: &str = "chat ID and an array of PDF IDs are required";
const PDF_DESCRIPTOR_REQUIRED: &str = "a PDF descriptor with a PDF ID is required";

/// Build the router with every PDF association route
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/pdfs",
            get(get_chat_pdfs)
                .post(add_chat_pdf)
                .put(set_chat_pdfs)
                .delete(remove_chat_pdf),
        )
        .route("/api/pdfs/catalog", get(list_catalog).post(register_pdf))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on `addr`
pub async fn start_server(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// First `chatId` of the query string; later repeats are ignored.
fn chat_id_param(uri: &Uri) -> Option<String> {
    let Query(pairs) = match Query::<Vec<(String, String)>>::try_from_uri(uri) {
        Ok(pairs) => pairs,
        Err(e) => {
            log::debug!("Rejected query string: {}", e);
            return None;
        }
    };
    let chat_id = pairs
        .into_iter()
        .find(|(key, _)| key == "chatId")
        .map(|(_, value)| value);
    present(chat_id)
}

/// Bodies that are absent or not valid JSON read as "no fields given".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        log::debug!("Rejected request body: {}", e);
        ApiError::BadRequest(CHAT_AND_PDF_REQUIRED)
    })
}

/// GET - PDFs linked to a chat
async fn get_chat_pdfs(
    AuthUser(session): AuthUser,
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Json<ChatPdfsResponse>, ApiError> {
    let chat_id = chat_id_param(&uri).ok_or(ApiError::BadRequest(CHAT_ID_REQUIRED))?;

    log::debug!("User {} reading PDFs of chat {}", session.user_id, chat_id);

    let (pdf_ids, version) = state.store.get_chat_selection(&chat_id)?;
    Ok(Json(ChatPdfsResponse { pdf_ids, version }))
}

/// POST - Add a PDF to a chat
async fn add_chat_pdf(
    AuthUser(session): AuthUser,
    State(state): State<Arc<AppState>>,
    uri: Uri,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let payload: PdfIdBody = parse_body(&body)?;
    let (chat_id, pdf_id) = match (chat_id_param(&uri), present(payload.pdf_id)) {
        (Some(chat_id), Some(pdf_id)) => (chat_id, pdf_id),
        _ => return Err(ApiError::BadRequest(CHAT_AND_PDF_REQUIRED)),
    };

    state.store.ensure_chat(&chat_id, &session.user_id)?;
    state.store.add_pdf_to_chat(&chat_id, &pdf_id)?;
    log::info!(
        "User {} linked PDF {} to chat {}",
        session.user_id,
        pdf_id,
        chat_id
    );
    Ok(Json(SuccessResponse::ok()))
}

/// PUT - Set all PDFs for a chat (replace)
async fn set_chat_pdfs(
    AuthUser(session): AuthUser,
    State(state): State<Arc<AppState>>,
    uri: Uri,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let payload: SetPdfsBody =
        parse_body(&body).map_err(|_| ApiError::BadRequest(CHAT_AND_PDF_LIST_REQUIRED))?;
    let (chat_id, pdf_ids) = match (chat_id_param(&uri), payload.pdf_ids) {
        (Some(chat_id), Some(pdf_ids)) => (chat_id, pdf_ids),
        _ => return Err(ApiError::BadRequest(CHAT_AND_PDF_LIST_REQUIRED)),
    };

    state.store.ensure_chat(&chat_id, &session.user_id)?;
    let response = match payload.version {
        Some(version) => {
            let write = state
                .store
                .set_chat_pdfs_versioned(&chat_id, &pdf_ids, version)?;
            SuccessResponse {
                success: true,
                applied: Some(write.applied),
                version: Some(write.version),
            }
        }
        None => {
            state.store.set_chat_pdfs(&chat_id, &pdf_ids)?;
            SuccessResponse::ok()
        }
    };

    log::info!(
        "User {} set {} PDFs on chat {} (version {:?})",
        session.user_id,
        pdf_ids.len(),
        chat_id,
        payload.version
    );
    Ok(Json(response))
}

/// DELETE - Remove a PDF from a chat
async fn remove_chat_pdf(
    AuthUser(session): AuthUser,
    State(state): State<Arc<AppState>>,
    uri: Uri,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let payload: PdfIdBody = parse_body(&body)?;
    let (chat_id, pdf_id) = match (chat_id_param(&uri), present(payload.pdf_id)) {
        (Some(chat_id), Some(pdf_id)) => (chat_id, pdf_id),
        _ => return Err(ApiError::BadRequest(CHAT_AND_PDF_REQUIRED)),
    };

    state.store.remove_pdf_from_chat(&chat_id, &pdf_id)?;
    log::info!(
        "User {} unlinked PDF {} from chat {}",
        session.user_id,
        pdf_id,
        chat_id
    );
    Ok(Json(SuccessResponse::ok()))
}

/// GET - Every PDF known to the store
async fn list_catalog(
    AuthUser(_session): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<CatalogResponse>, ApiError> {
    let pdfs = state.store.list_pdfs()?;
    Ok(Json(CatalogResponse { pdfs }))
}

/// POST - Register or update a PDF descriptor once ingestion has produced it
async fn register_pdf(
    AuthUser(session): AuthUser,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let pdf: PdfDescriptor = serde_json::from_slice(&body).map_err(|e| {
        log::debug!("Rejected PDF descriptor: {}", e);
        ApiError::BadRequest(PDF_DESCRIPTOR_REQUIRED)
    })?;
    if pdf.pdf_id.is_empty() {
        return Err(ApiError::BadRequest(PDF_DESCRIPTOR_REQUIRED));
    }

    state.store.upsert_pdf(&pdf)?;
    log::info!("User {} registered PDF {} ({})", session.user_id, pdf.pdf_id, pdf.name);
    Ok(Json(SuccessResponse::ok()))
}
