//! Client for the remote image API
//!
//! Endpoints, relative to the configured base URL:
//! 1. `GET /{owner}/images` lists the owner's images
//! 2. `POST /{owner}/images` uploads one image as multipart field `file`,
//!    with an optional PNG preview in field `thumbnail`
//! 3. `DELETE /{owner}/images/{id}` deletes one image
//! 4. `GET /{owner}` reports whether the account exists

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::auth_store::AuthStore;
use crate::config_loader::Api;
use crate::models::ImageFile;

/// Size of each body chunk streamed during an upload
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

const THUMBNAIL_FILE_NAME: &str = "thumbnail.png";

/// Error types for API calls
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("API is not configured: {0}")]
    NotConfigured(String),
}

/// Result type for API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Image as the API describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteImage {
    pub id: String,
    /// URL of the cover-size rendition
    pub cover: String,
    /// URL of the original
    pub original: String,
}

/// Called with `(bytes_sent, total_bytes)` as upload chunks are consumed
pub type UploadProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub struct ApiClient {
    client: Client,
    base_url: String,
    owner: String,
    auth: Option<Arc<AuthStore>>,
}

impl ApiClient {
    pub fn new(config: &Api) -> ApiResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ApiError::NotConfigured("api.base_url is empty".to_string()));
        }
        if config.owner.trim().is_empty() {
            return Err(ApiError::NotConfigured("api.owner is empty".to_string()));
        }

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .build()?;

        info!("Initialized API client for {}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            auth: None,
        })
    }

    /// Send the session token from `auth` with every request
    pub fn with_auth(mut self, auth: Arc<AuthStore>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.as_ref().and_then(|auth| auth.token()) {
            Some(token) => request.bearer_auth(token),
            None => {
                debug!("No session token, making unauthenticated request");
                request
            }
        }
    }

    /// List the owner's images
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn list_images(&self) -> ApiResult<Vec<RemoteImage>> {
        let request = self.client.get(self.endpoint(&format!("{}/images", self.owner)));
        let response = check_status(self.authorize(request).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Whether `username` exists on the server
    pub async fn check_username(&self, username: &str) -> ApiResult<bool> {
        let request = self.client.get(self.endpoint(username));
        let response = check_status(self.authorize(request).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Upload `file`, streaming its body in [`UPLOAD_CHUNK_SIZE`] chunks
    #[instrument(skip(self, file, thumbnail, progress), fields(file = %file.name, size = file.size()))]
    pub async fn upload(
        &self,
        file: &ImageFile,
        thumbnail: Option<&Bytes>,
        progress: Option<UploadProgressFn>,
    ) -> ApiResult<RemoteImage> {
        let total = file.size();
        let chunks = split_chunks(&file.bytes, UPLOAD_CHUNK_SIZE);

        let mut sent = 0u64;
        let body = stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            if let Some(report) = &progress {
                report(sent, total);
            }
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let part = Part::stream_with_length(Body::wrap_stream(body), total)
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)?;
        let mut form = Form::new().part("file", part);
        if let Some(thumbnail) = thumbnail {
            let preview = Part::stream_with_length(Body::from(thumbnail.clone()), thumbnail.len() as u64)
                .file_name(THUMBNAIL_FILE_NAME)
                .mime_str("image/png")?;
            form = form.part("thumbnail", preview);
        }

        let request = self
            .client
            .post(self.endpoint(&format!("{}/images", self.owner)))
            .multipart(form);
        let response = check_status(self.authorize(request).send().await?).await?;
        let image: RemoteImage = response.json().await?;

        debug!(id = %image.id, "Upload accepted");
        Ok(image)
    }

    /// Delete image `id`
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn delete(&self, id: &str) -> ApiResult<()> {
        let request = self
            .client
            .delete(self.endpoint(&format!("{}/images/{}", self.owner, id)));
        check_status(self.authorize(request).send().await?).await?;
        Ok(())
    }
}

fn split_chunks(bytes: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    if bytes.is_empty() {
        return vec![Bytes::new()];
    }
    (0..bytes.len())
        .step_by(chunk_size)
        .map(|start| bytes.slice(start..(start + chunk_size).min(bytes.len())))
        .collect()
}

/// Turn non-success responses into [`ApiError::Status`] with a readable message
async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match status {
        StatusCode::UNAUTHORIZED => "Authentication failed. Check your session token.".to_string(),
        StatusCode::FORBIDDEN => "Access forbidden. You may not own this resource.".to_string(),
        StatusCode::NOT_FOUND => "Resource not found.".to_string(),
        StatusCode::PAYLOAD_TOO_LARGE => "The image is larger than the server accepts.".to_string(),
        _ => {
            let body = response.text().await.unwrap_or_default();
            if body.is_empty() {
                status.canonical_reason().unwrap_or("Unexpected response").to_string()
            } else {
                body
            }
        }
    };
    warn!(status = status.as_u16(), "API request failed: {}", message);

    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}
