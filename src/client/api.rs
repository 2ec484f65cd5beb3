//! REST API Client
//!
//! The persistence side of messaging: history snapshots, project metadata
//! and the durable send path. [`MessagingApi`] is the seam the reconciler
//! depends on; [`HttpApi`] is the reqwest implementation.

use crate::client::auth::CredentialSupplier;
use crate::shared::config::AppConfig;
use crate::shared::error::ApiError;
use crate::shared::messaging::{MessageDto, ProjectDto, SendMessageRequest};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Endpoints the reconciler consumes
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// `GET /messages/{id}`
    async fn fetch_messages(&self, conversation_id: i64) -> Result<Vec<MessageDto>, ApiError>;

    /// `GET /projects/{id}`
    async fn fetch_project(&self, conversation_id: i64) -> Result<ProjectDto, ApiError>;

    /// `GET /projects/student/me`
    async fn fetch_my_projects(&self) -> Result<Vec<ProjectDto>, ApiError>;

    /// `POST /messages/{id}`
    async fn post_message(&self, conversation_id: i64, content: &str)
        -> Result<Option<MessageDto>, ApiError>;
}

#[async_trait]
impl<T: MessagingApi + ?Sized> MessagingApi for Arc<T> {
    async fn fetch_messages(&self, conversation_id: i64) -> Result<Vec<MessageDto>, ApiError> {
        (**self).fetch_messages(conversation_id).await
    }

    async fn fetch_project(&self, conversation_id: i64) -> Result<ProjectDto, ApiError> {
        (**self).fetch_project(conversation_id).await
    }

    async fn fetch_my_projects(&self) -> Result<Vec<ProjectDto>, ApiError> {
        (**self).fetch_my_projects().await
    }

    async fn post_message(
        &self,
        conversation_id: i64,
        content: &str,
    ) -> Result<Option<MessageDto>, ApiError> {
        (**self).post_message(conversation_id, content).await
    }
}

/// reqwest-backed client for the campus backend
#[derive(Clone)]
pub struct HttpApi {
    config: AppConfig,
    client: Client,
    credentials: Arc<dyn CredentialSupplier>,
}

impl HttpApi {
    pub fn new(config: AppConfig, credentials: Arc<dyn CredentialSupplier>) -> Self {
        Self {
            config,
            client: Client::new(),
            credentials,
        }
    }

    /// Attach the bearer token while it is valid
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) if self.credentials.is_valid() => {
                request.header("Authorization", format!("Bearer {}", token))
            }
            _ => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.config.api_url(path);
        tracing::debug!("[API] GET {}", url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let response = check_status(response).await?;
        decode(response).await
    }
}

#[async_trait]
impl MessagingApi for HttpApi {
    async fn fetch_messages(&self, conversation_id: i64) -> Result<Vec<MessageDto>, ApiError> {
        self.get_json(&format!("/messages/{}", conversation_id)).await
    }

    async fn fetch_project(&self, conversation_id: i64) -> Result<ProjectDto, ApiError> {
        self.get_json(&format!("/projects/{}", conversation_id)).await
    }

    async fn fetch_my_projects(&self) -> Result<Vec<ProjectDto>, ApiError> {
        self.get_json("/projects/student/me").await
    }

    async fn post_message(
        &self,
        conversation_id: i64,
        content: &str,
    ) -> Result<Option<MessageDto>, ApiError> {
        let url = self.config.api_url(&format!("/messages/{}", conversation_id));
        tracing::debug!("[API] POST {}", url);
        let request = SendMessageRequest {
            content: content.to_string(),
        };
        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let response = check_status(response).await?;

        // some deployments answer 201 with an empty body
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
        StatusCode::FORBIDDEN => Err(ApiError::Forbidden),
        _ => {
            let error_text = response.text().await.unwrap_or_default();
            Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&error_text).unwrap_or_else(|| status.to_string()),
            })
        }
    }
}

/// `message` field of a JSON error body, or the raw text
fn error_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => json
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| Some(body.to_string())),
        Err(_) => Some(body.to_string()),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}
