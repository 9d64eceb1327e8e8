//! Transfer backends for the upload pipeline

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::api::{ApiClient, ApiError, UploadProgressFn};
use crate::models::ImageFile;
use crate::upload::progress::ProgressReporter;
use crate::utils::hash_from_url;

/// Error types for transfers
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Transfer rejected: {0}")]
    Rejected(String),
}

/// Result type for transfers
pub type TransportResult<T> = Result<T, TransportError>;

/// What a transport is asked to move
pub struct TransferRequest<'a> {
    pub file: &'a ImageFile,
    pub hash: &'a str,
    /// PNG preview produced by the thumbnail step, when it ran
    pub thumbnail: Option<&'a Bytes>,
}

/// What a transport reports back after a successful transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Server-side identifier, when the backend assigns one
    pub remote_id: Option<String>,
}

/// A hosted image to remove
#[derive(Debug, Clone, Copy)]
pub struct DeleteRequest<'a> {
    pub url: &'a str,
    /// Server id recorded at upload time, if any
    pub remote_id: Option<&'a str>,
    pub delete_token: &'a str,
}

/// Moves processed bytes to the host and deletes them again
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Transfer one file, reporting progress through `progress`
    async fn transfer(
        &self,
        request: TransferRequest<'_>,
        progress: Arc<ProgressReporter>,
    ) -> TransportResult<TransferReceipt>;

    /// Delete a hosted image
    async fn delete(&self, request: DeleteRequest<'_>) -> TransportResult<()>;
}

/// Local stand-in for a host: waits `latency` while ticking progress every `tick`
pub struct SimulatedTransport {
    latency: Duration,
    tick: Duration,
}

impl SimulatedTransport {
    pub fn new(latency: Duration, tick: Duration) -> Self {
        Self { latency, tick }
    }

    /// No delay at all; progress jumps straight to 100
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn transfer(
        &self,
        request: TransferRequest<'_>,
        progress: Arc<ProgressReporter>,
    ) -> TransportResult<TransferReceipt> {
        progress.report(0);

        if !self.latency.is_zero() && !self.tick.is_zero() {
            let ticks = (self.latency.as_millis() / self.tick.as_millis()).max(1) as u64;
            for n in 1..=ticks {
                sleep(self.tick).await;
                // 100 is reserved for completion
                progress.report(((n * 100 / ticks) as u8).min(99));
            }
        }

        progress.complete();
        debug!(
            hash = request.hash,
            bytes = request.file.size(),
            thumbnail_bytes = request.thumbnail.map_or(0, Bytes::len),
            "Simulated transfer complete"
        );
        Ok(TransferReceipt::default())
    }

    async fn delete(&self, request: DeleteRequest<'_>) -> TransportResult<()> {
        debug!(url = request.url, "Simulated delete");
        Ok(())
    }
}

/// Transfers through the remote image API
pub struct HttpTransport {
    client: Arc<ApiClient>,
}

impl HttpTransport {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    /// Server id for a delete: the recorded one, else the content hash in the URL
    fn remote_id_for<'a>(request: &DeleteRequest<'a>) -> TransportResult<&'a str> {
        if let Some(id) = request.remote_id {
            return Ok(id);
        }
        hash_from_url(request.url)
            .ok_or_else(|| TransportError::Rejected(format!("{} is not a hosted image URL", request.url)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn transfer(
        &self,
        request: TransferRequest<'_>,
        progress: Arc<ProgressReporter>,
    ) -> TransportResult<TransferReceipt> {
        progress.report(0);

        let reporter = progress.clone();
        let callback: UploadProgressFn = Arc::new(move |sent, total| {
            reporter.report_bytes(sent, total);
        });
        let image = self
            .client
            .upload(request.file, request.thumbnail, Some(callback))
            .await?;

        progress.complete();
        info!(hash = request.hash, remote_id = %image.id, "Uploaded to {}", image.original);

        Ok(TransferReceipt {
            remote_id: Some(image.id),
        })
    }

    async fn delete(&self, request: DeleteRequest<'_>) -> TransportResult<()> {
        let id = Self::remote_id_for(&request)?;
        self.client.delete(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_loader::Api;
    use crate::events::{EventBus, EventKind, UploadEvent};
    use parking_lot::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn recorded(bus: &EventBus) -> Arc<Mutex<Vec<u8>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(EventKind::UploadProgress, move |event| {
            if let UploadEvent::Progress(p) = event {
                sink.lock().push(p.progress);
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_simulated_transfer_ticks_to_completion() {
        let bus = Arc::new(EventBus::new());
        let seen = recorded(&bus);
        let reporter = Arc::new(ProgressReporter::new(bus, "a.png", 10));
        let transport = SimulatedTransport::new(Duration::from_millis(50), Duration::from_millis(10));
        let file = ImageFile::new("a.png", "image/png", vec![1u8; 4]);

        transport
            .transfer(
                TransferRequest {
                    file: &file,
                    hash: "0123456789",
                    thumbnail: None,
                },
                reporter.clone(),
            )
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    fn client(base_url: &str) -> ApiClient {
        ApiClient::new(&Api {
            base_url: base_url.to_string(),
            public_base_url: "https://image.vastsea.cc".to_string(),
            owner: "alice".to_string(),
            timeout_seconds: 5,
            user_agent: "imghost-tests".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_transport_uploads_and_deletes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alice/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "srv-1", "cover": "https://cdn/c", "original": "https://cdn/o"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/alice/images/srv-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Arc::new(client(&server.uri())));

        let bus = Arc::new(EventBus::new());
        let seen = recorded(&bus);
        let reporter = Arc::new(ProgressReporter::new(bus, "a.png", 10));
        let file = ImageFile::new("a.png", "image/png", vec![3u8; 1024]);

        let receipt = transport
            .transfer(
                TransferRequest {
                    file: &file,
                    hash: "abcdef0123",
                    thumbnail: None,
                },
                reporter.clone(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.remote_id.as_deref(), Some("srv-1"));
        assert_eq!(seen.lock().last(), Some(&100));

        transport
            .delete(DeleteRequest {
                url: "https://image.vastsea.cc/abcdef0123",
                remote_id: receipt.remote_id.as_deref(),
                delete_token: "token",
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_delete_without_recorded_id_uses_hash() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/alice/images/abcdef0123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Arc::new(client(&server.uri())));
        transport
            .delete(DeleteRequest {
                url: "https://image.vastsea.cc/abcdef0123",
                remote_id: None,
                delete_token: "token",
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_delete_rejects_foreign_url() {
        let transport = HttpTransport::new(Arc::new(client("http://127.0.0.1:9")));

        assert!(matches!(
            transport
                .delete(DeleteRequest {
                    url: "https://elsewhere/cat.png",
                    remote_id: None,
                    delete_token: "t",
                })
                .await,
            Err(TransportError::Rejected(_))
        ));
    }
}
