//! Upload pipeline
//!
//! Every file passes through the same fixed stages:
//! 1. Validation (the MIME type must be `image/*`)
//! 2. Fingerprinting through the [`HashEngine`]
//! 3. Duplicate short-circuit: content already committed is never transferred
//!    again, the canonical locators are returned instead. A file whose content
//!    is being uploaded by another call right now waits for that call to
//!    commit or fail before deciding
//! 4. Processing (EXIF removal, watermark, thumbnail), each step non-fatal
//! 5. Transfer through a [`Transport`]
//! 6. Commit to the [`ImageStore`], which announces `upload:success`
//!
//! Batches are processed sequentially; a failing file is reported on
//! `upload:error` and skipped. There is no cancellation: an upload that has
//! started runs to completion or failure.

pub mod processing;
pub mod progress;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config_loader::AppConfig;
use crate::events::{EventBus, ProgressEvent, UploadEvent};
use crate::hashing::{HashCache, HashEngine, HashError};
use crate::image_store::{ImageStore, ImageStoreError};
use crate::models::{ImageFile, NewImage, UploadOptions, UploadResult};
use crate::staging::StagingStore;
use crate::utils::{filename_from_url, generate_id, now_millis};

use processing::Thumbnail;
use progress::ProgressReporter;
use transport::{DeleteRequest, TransferRequest, Transport, TransportError};

/// Length of generated delete tokens
pub const DELETE_TOKEN_LENGTH: usize = 20;

/// Progress checkpoints published by the processing steps
pub const EXIF_CHECKPOINT: u8 = 30;
pub const WATERMARK_CHECKPOINT: u8 = 50;
pub const THUMBNAIL_CHECKPOINT: u8 = 70;

/// File name used when a URL has no usable last segment
pub const FALLBACK_URL_FILENAME: &str = "image.jpg";

/// Error types for the upload pipeline
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid file: {0}")]
    Validation(String),

    #[error("Could not fetch image: {0}")]
    Fetch(String),

    #[error("Hashing failed: {0}")]
    Hash(#[from] HashError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransportError),

    #[error("Could not save image record: {0}")]
    Store(#[from] ImageStoreError),

    #[error("Config error: {0}")]
    Config(String),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, UploadError>;

/// Pipeline knobs taken from the application config
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Host the hash-addressed locators are built on
    pub public_base_url: String,
    /// Minimum change between two transfer progress events, in percent
    pub progress_step: u8,
    pub user_agent: String,
    pub fetch_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            public_base_url: config.api.public_base_url.trim_end_matches('/').to_string(),
            progress_step: config.upload.progress_step,
            user_agent: config.api.user_agent.clone(),
            fetch_timeout: Duration::from_secs(config.api.timeout_seconds),
        }
    }
}

/// Bytes after processing plus what the thumbnail step learned
struct Processed {
    file: ImageFile,
    thumbnail: Option<Thumbnail>,
}

/// Uploads between fingerprinting and commit. The value resolves to
/// `Some(committed)` once the owning call finishes.
type InFlight = DashMap<String, watch::Receiver<Option<bool>>>;

/// Outcome of claiming a fingerprint
enum Claim {
    /// This call transfers and commits the content
    Owner(FlightGuard),
    /// The content is already committed
    Known,
    /// Another call is uploading the same content
    Wait(watch::Receiver<Option<bool>>),
}

/// Held by the call that owns an in-flight fingerprint. Dropping it without
/// [`FlightGuard::commit`] withdraws the fingerprint from the cache, so a
/// failed or abandoned upload is never treated as a duplicate.
struct FlightGuard {
    fingerprint: String,
    inflight: Arc<InFlight>,
    cache: Arc<HashCache>,
    done: watch::Sender<Option<bool>>,
    committed: bool,
}

impl FlightGuard {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.cache.forget(&self.fingerprint);
        }
        self.inflight.remove(&self.fingerprint);
        self.done.send_replace(Some(self.committed));
    }
}

pub struct UploadPipeline {
    hasher: Arc<HashEngine>,
    store: Arc<ImageStore>,
    events: Arc<EventBus>,
    transport: Arc<dyn Transport>,
    inflight: Arc<InFlight>,
    fetcher: Client,
    settings: PipelineSettings,
}

impl UploadPipeline {
    pub fn new(
        hasher: Arc<HashEngine>,
        store: Arc<ImageStore>,
        events: Arc<EventBus>,
        transport: Arc<dyn Transport>,
        settings: PipelineSettings,
    ) -> PipelineResult<Self> {
        let fetcher = Client::builder()
            .user_agent(&settings.user_agent)
            .timeout(settings.fetch_timeout)
            .build()
            .map_err(|e| UploadError::Config(format!("failed to build HTTP client: {}", e)))?;

        info!(transport = transport.name(), "Upload pipeline ready");

        Ok(Self {
            hasher,
            store,
            events,
            transport,
            inflight: Arc::new(DashMap::new()),
            fetcher,
            settings,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Hash-addressed location of the original
    pub fn image_url(&self, hash: &str) -> String {
        format!("{}/{}", self.settings.public_base_url, hash)
    }

    /// Hash-addressed location of the thumbnail
    pub fn thumbnail_url(&self, hash: &str) -> String {
        format!("{}/thumbnails/{}", self.settings.public_base_url, hash)
    }

    /// Upload one file. Failures are also published on `upload:error`
    #[instrument(skip(self, file, options), fields(file = %file.name))]
    pub async fn upload_file(&self, file: ImageFile, options: &UploadOptions) -> PipelineResult<UploadResult> {
        let custom_name = options.metadata.custom_name.clone();
        self.run(file, options, custom_name).await.inspect_err(|e| {
            self.events.error(e.to_string());
        })
    }

    /// Upload files one after another, skipping the ones that fail
    pub async fn upload_files(&self, files: Vec<ImageFile>, options: &UploadOptions) -> Vec<UploadResult> {
        self.upload_files_indexed(files, options)
            .await
            .into_iter()
            .map(|(_, result)| result)
            .collect()
    }

    /// Like [`upload_files`](Self::upload_files), keeping each result's input index
    #[instrument(skip(self, files, options), fields(count = files.len()))]
    pub async fn upload_files_indexed(
        &self,
        files: Vec<ImageFile>,
        options: &UploadOptions,
    ) -> Vec<(usize, UploadResult)> {
        let total = files.len();
        let mut results = Vec::with_capacity(total);

        for (index, file) in files.into_iter().enumerate() {
            let name = file.name.clone();
            let custom_name = options.metadata.name_for(index).map(str::to_string);

            match self.run(file, options, custom_name).await {
                Ok(result) => results.push((index, result)),
                Err(e) => {
                    warn!(file = %name, "Upload failed: {}", e);
                    self.events.error(format!("Failed to upload {}: {}", name, e));
                }
            }
        }

        info!("Batch finished: {}/{} uploaded", results.len(), total);
        results
    }

    /// Upload the selected staged files under their staged names. Entries that
    /// upload successfully leave the staging area; failures stay staged.
    pub async fn upload_staged(&self, staging: &StagingStore, options: &UploadOptions) -> Vec<UploadResult> {
        let selected = staging.get_selected_images();
        if selected.is_empty() {
            debug!("Nothing selected for upload");
            return Vec::new();
        }

        let names: BTreeMap<usize, String> = selected
            .iter()
            .enumerate()
            .map(|(i, staged)| (i, staged.custom_name.clone()))
            .collect();
        let options = options.clone().with_custom_names(names);
        let files = selected.iter().map(|staged| staged.file.clone()).collect();

        let uploaded = self.upload_files_indexed(files, &options).await;

        let committed: Vec<String> = uploaded.iter().map(|(i, _)| selected[*i].id.clone()).collect();
        // Dropping the detached entries releases their previews
        drop(staging.take(&committed));

        uploaded.into_iter().map(|(_, result)| result).collect()
    }

    /// Fetch an image over HTTP and upload it
    #[instrument(skip(self, options))]
    pub async fn upload_from_url(&self, url: &str, options: &UploadOptions) -> PipelineResult<UploadResult> {
        let file = match self.fetch(url).await {
            Ok(file) => file,
            Err(e) => {
                self.events.error(e.to_string());
                return Err(e);
            }
        };
        self.upload_file(file, options).await
    }

    /// Delete a hosted image. Returns false when the host refused; the
    /// failure is published on `upload:error`.
    #[instrument(skip(self, delete_token))]
    pub async fn delete_image(&self, url: &str, delete_token: &str) -> bool {
        let record = self.store.find_by_url(url);
        let request = DeleteRequest {
            url,
            remote_id: record.as_ref().and_then(|r| r.remote_id.as_deref()),
            delete_token,
        };
        if let Err(e) = self.transport.delete(request).await {
            error!("Delete failed: {}", e);
            self.events.error(format!("Failed to delete {}: {}", url, e));
            return false;
        }

        let filename = record
            .as_ref()
            .map(|r| r.filename.clone())
            .unwrap_or_else(|| filename_from_url(url).to_string());

        if let Some(record) = record {
            if let Err(e) = self.store.remove_image(&record.id) {
                warn!("Image deleted remotely but the record could not be removed: {}", e);
                self.events.error(format!("Failed to update gallery after deleting {}: {}", filename, e));
            }
        }

        self.events.progress(ProgressEvent::new(filename, 100).with_message("deleted"));
        true
    }

    async fn fetch(&self, url: &str) -> PipelineResult<ImageFile> {
        let response = self
            .fetcher
            .get(url)
            .send()
            .await
            .map_err(|e| UploadError::Fetch(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Fetch(format!("{} returned HTTP {}", url, status.as_u16())));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_default();
        if !content_type.starts_with("image/") {
            return Err(UploadError::Fetch(format!("{} is not an image ({})", url, content_type)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UploadError::Fetch(format!("{}: {}", url, e)))?;

        Ok(ImageFile::new(url_filename(url), content_type, bytes))
    }

    async fn run(
        &self,
        file: ImageFile,
        options: &UploadOptions,
        custom_name: Option<String>,
    ) -> PipelineResult<UploadResult> {
        if !file.is_image() {
            return Err(UploadError::Validation(format!(
                "{} is not an image ({})",
                file.name, file.mime_type
            )));
        }

        let hash = self.hasher.digest(&file).await?;

        let flight = loop {
            match self.claim(&hash) {
                Claim::Owner(guard) => break guard,
                Claim::Known => return self.short_circuit(&file, &hash, options, custom_name),
                Claim::Wait(mut done) => {
                    debug!(file = %file.name, %hash, "Same content is already uploading, waiting");
                    // Either outcome sends us back to claim: a commit makes the
                    // content known, a failure frees the fingerprint
                    let _ = done.wait_for(Option::is_some).await;
                }
            }
        };

        let filename = file.name.clone();
        let processed = self.process(file, options);
        let size = processed.file.size();

        let reporter = Arc::new(ProgressReporter::new(
            self.events.clone(),
            processed.file.name.clone(),
            self.settings.progress_step,
        ));
        let request = TransferRequest {
            file: &processed.file,
            hash: &hash,
            thumbnail: processed.thumbnail.as_ref().map(|t| &t.bytes),
        };

        // Dropping `flight` on any early return withdraws the fingerprint
        let receipt = self.transport.transfer(request, reporter).await?;

        let result = UploadResult {
            url: self.image_url(&hash),
            thumbnail_url: self.thumbnail_url(&hash),
            delete_token: generate_id(DELETE_TOKEN_LENGTH),
            hash: hash.clone(),
            deduplicated: false,
        };

        let thumbnail = processed.thumbnail;
        self.store.add_image(NewImage {
            id: Some(hash),
            url: result.url.clone(),
            thumbnail_url: result.thumbnail_url.clone(),
            filename,
            custom_name,
            size,
            width: thumbnail.as_ref().map(|t| t.width),
            height: thumbnail.as_ref().map(|t| t.height),
            format: thumbnail.map(|t| t.format),
            upload_time: now_millis(),
            delete_token: result.delete_token.clone(),
            category_id: options.metadata.category_id.clone(),
            remote_id: receipt.remote_id,
        })?;
        flight.commit();

        Ok(result)
    }

    /// Decide who uploads `hash`. Registration in the cache and the in-flight
    /// entry are made under the same map entry lock, so exactly one caller
    /// becomes the owner of new content.
    fn claim(&self, hash: &str) -> Claim {
        match self.inflight.entry(hash.to_string()) {
            Entry::Occupied(entry) => Claim::Wait(entry.get().clone()),
            Entry::Vacant(entry) => {
                let fresh = self.hasher.cache().insert(hash);
                // A record from an earlier session also makes the content known
                if !fresh || self.store.contains(hash) {
                    return Claim::Known;
                }

                let (done, pending) = watch::channel(None);
                entry.insert(pending);
                Claim::Owner(FlightGuard {
                    fingerprint: hash.to_string(),
                    inflight: self.inflight.clone(),
                    cache: self.hasher.cache().clone(),
                    done,
                    committed: false,
                })
            }
        }
    }

    /// Duplicate path: no processing, no transfer
    fn short_circuit(
        &self,
        file: &ImageFile,
        hash: &str,
        options: &UploadOptions,
        custom_name: Option<String>,
    ) -> PipelineResult<UploadResult> {
        info!(file = %file.name, hash, "Duplicate content, skipping transfer");
        self.events.progress(ProgressEvent::new(file.name.clone(), 100));

        let existing = self.store.get(hash);
        let mut result = UploadResult {
            url: self.image_url(hash),
            thumbnail_url: self.thumbnail_url(hash),
            delete_token: existing
                .as_ref()
                .map(|record| record.delete_token.clone())
                .unwrap_or_else(|| generate_id(DELETE_TOKEN_LENGTH)),
            hash: hash.to_string(),
            deduplicated: true,
        };

        // Known to the cache but missing from the gallery, e.g. after the
        // gallery was cleared: restore the record without transferring
        if existing.is_none() {
            let restored = self.store.add_image(NewImage {
                id: Some(hash.to_string()),
                url: result.url.clone(),
                thumbnail_url: result.thumbnail_url.clone(),
                filename: file.name.clone(),
                custom_name,
                size: file.size(),
                width: None,
                height: None,
                format: None,
                upload_time: now_millis(),
                delete_token: result.delete_token.clone(),
                category_id: options.metadata.category_id.clone(),
                remote_id: None,
            });
            match restored {
                Ok(_) => {}
                // Restored by a concurrent duplicate in the meantime
                Err(ImageStoreError::DuplicateImage(_)) => {
                    if let Some(record) = self.store.get(hash) {
                        result.delete_token = record.delete_token;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.events.emit(UploadEvent::Deduplicated {
            filename: file.name.clone(),
            hash: hash.to_string(),
        });
        Ok(result)
    }

    fn process(&self, file: ImageFile, options: &UploadOptions) -> Processed {
        let mut file = file;
        let mut thumbnail = None;

        if options.remove_exif {
            match processing::strip_exif(&file.bytes) {
                Ok(bytes) => {
                    file.bytes = bytes;
                    self.checkpoint(&file.name, EXIF_CHECKPOINT, "EXIF removed");
                }
                Err(e) => self.step_failed(&file.name, EXIF_CHECKPOINT, "EXIF removal", e),
            }
        }

        if options.add_watermark {
            match processing::embed_watermark(&file.bytes, &options.watermark_text) {
                Ok(bytes) => {
                    file.bytes = bytes;
                    self.checkpoint(&file.name, WATERMARK_CHECKPOINT, "watermark added");
                }
                Err(e) => self.step_failed(&file.name, WATERMARK_CHECKPOINT, "watermarking", e),
            }
        }

        if options.generate_thumbnail {
            match processing::make_thumbnail(&file.bytes, options.max_width, options.max_height) {
                Ok(thumb) => {
                    thumbnail = Some(thumb);
                    self.checkpoint(&file.name, THUMBNAIL_CHECKPOINT, "thumbnail generated");
                }
                Err(e) => self.step_failed(&file.name, THUMBNAIL_CHECKPOINT, "thumbnail generation", e),
            }
        }

        Processed { file, thumbnail }
    }

    fn checkpoint(&self, filename: &str, progress: u8, message: &str) {
        self.events
            .progress(ProgressEvent::new(filename, progress).with_message(message));
    }

    fn step_failed(&self, filename: &str, progress: u8, step: &str, err: processing::ProcessingError) {
        warn!(file = filename, "{} failed, keeping unprocessed bytes: {}", step, err);
        self.events.error(format!("{} failed for {}: {}", step, filename, err));
        self.checkpoint(filename, progress, &format!("{} skipped", step));
    }
}

/// Last path segment of `url` without query or fragment
fn url_filename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = filename_from_url(path);
    if name.is_empty() || name.contains(':') {
        FALLBACK_URL_FILENAME.to_string()
    } else {
        name.to_string()
    }
}
