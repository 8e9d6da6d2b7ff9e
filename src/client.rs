use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ClientConfig;
use crate::models::{
    CatalogResponse, ChatPdfsResponse, ErrorBody, PdfDescriptor, SetPdfsBody, SuccessResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

impl ClientError {
    /// Transport failures and 5xx are worth another try; other API errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
        }
    }
}

/// Server answer to a versioned replace-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceAck {
    pub applied: bool,
    /// Version the server holds after the call.
    pub version: u64,
}

/// The two calls the selection cache makes against the association service.
#[async_trait]
pub trait SelectionRemote: Send + Sync {
    /// Authoritative selection and its version for a chat.
    async fn fetch(&self, chat_id: &str) -> Result<ChatPdfsResponse, ClientError>;

    /// Replace-all sync. Not applied when the server already holds `version`
    /// or newer; the ack then carries the server's version.
    async fn replace(
        &self,
        chat_id: &str,
        pdf_ids: &[String],
        version: u64,
    ) -> Result<ReplaceAck, ClientError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PdfIdPayload<'a> {
    pdf_id: &'a str,
}

/// HTTP client for the `/api/pdfs` endpoints.
#[derive(Debug, Clone)]
pub struct AssociationClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl AssociationClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.server_url.clone(), config.api_token.clone())
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    fn pdfs_url(&self) -> String {
        format!("{}/api/pdfs", self.base_url)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let resp = self.authed(req).send().await?;
        decode(resp).await
    }

    pub async fn get_pdf_ids(&self, chat_id: &str) -> Result<ChatPdfsResponse, ClientError> {
        let req = self.http.get(self.pdfs_url()).query(&[("chatId", chat_id)]);
        self.send(req).await
    }

    pub async fn add_pdf(&self, chat_id: &str, pdf_id: &str) -> Result<(), ClientError> {
        let req = self
            .http
            .post(self.pdfs_url())
            .query(&[("chatId", chat_id)])
            .json(&PdfIdPayload { pdf_id });
        let _: SuccessResponse = self.send(req).await?;
        Ok(())
    }

    pub async fn remove_pdf(&self, chat_id: &str, pdf_id: &str) -> Result<(), ClientError> {
        let req = self
            .http
            .delete(self.pdfs_url())
            .query(&[("chatId", chat_id)])
            .json(&PdfIdPayload { pdf_id });
        let _: SuccessResponse = self.send(req).await?;
        Ok(())
    }

    /// Unversioned replace-all.
    pub async fn set_pdf_ids(&self, chat_id: &str, pdf_ids: &[String]) -> Result<(), ClientError> {
        let _ = self.put(chat_id, pdf_ids, None).await?;
        Ok(())
    }

    async fn put(
        &self,
        chat_id: &str,
        pdf_ids: &[String],
        version: Option<u64>,
    ) -> Result<SuccessResponse, ClientError> {
        let body = SetPdfsBody {
            pdf_ids: Some(pdf_ids.to_vec()),
            version,
        };
        let req = self
            .http
            .put(self.pdfs_url())
            .query(&[("chatId", chat_id)])
            .json(&body);
        self.send(req).await
    }

    pub async fn list_pdfs(&self) -> Result<Vec<PdfDescriptor>, ClientError> {
        let req = self.http.get(format!("{}/catalog", self.pdfs_url()));
        let catalog: CatalogResponse = self.send(req).await?;
        Ok(catalog.pdfs)
    }

    /// Registers a descriptor produced by ingestion so chats can link it.
    pub async fn register_pdf(&self, pdf: &PdfDescriptor) -> Result<(), ClientError> {
        let req = self.http.post(format!("{}/catalog", self.pdfs_url())).json(pdf);
        let _: SuccessResponse = self.send(req).await?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl SelectionRemote for AssociationClient {
    async fn fetch(&self, chat_id: &str) -> Result<ChatPdfsResponse, ClientError> {
        self.get_pdf_ids(chat_id).await
    }

    async fn replace(
        &self,
        chat_id: &str,
        pdf_ids: &[String],
        version: u64,
    ) -> Result<ReplaceAck, ClientError> {
        let resp = self.put(chat_id, pdf_ids, Some(version)).await?;
        Ok(ReplaceAck {
            applied: resp.applied.unwrap_or(true),
            version: resp.version.unwrap_or(version),
        })
    }
}
