//! End-to-end flows through the public API with a recording transport

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use imghost::upload::progress::ProgressReporter;
use imghost::{
    DeleteRequest, EventBus, EventKind, HashCache, HashEngine, ImageFile, ImageStore, PipelineSettings, PreviewRegistry,
    StagingStore, Storage, TransferReceipt, TransferRequest, Transport, TransportError, UploadEvent,
    UploadOptions, UploadPipeline, fingerprint,
};

#[derive(Default)]
struct RecordingTransport {
    transfers: AtomicUsize,
    deletes: AtomicUsize,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn transfer(
        &self,
        _request: TransferRequest<'_>,
        progress: Arc<ProgressReporter>,
    ) -> Result<TransferReceipt, TransportError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        progress.report(0);
        progress.complete();
        Ok(TransferReceipt::default())
    }

    async fn delete(&self, _request: DeleteRequest<'_>) -> Result<(), TransportError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    events: Arc<EventBus>,
    store: Arc<ImageStore>,
    transport: Arc<RecordingTransport>,
    pipeline: UploadPipeline,
}

fn harness() -> Harness {
    let events = Arc::new(EventBus::new());
    let store = Arc::new(ImageStore::new(Storage::in_memory().unwrap(), events.clone()).unwrap());
    let transport = Arc::new(RecordingTransport::default());
    let hasher = Arc::new(HashEngine::inline(Arc::new(HashCache::new())));
    let pipeline = UploadPipeline::new(
        hasher,
        store.clone(),
        events.clone(),
        transport.clone(),
        PipelineSettings::default(),
    )
    .unwrap();

    Harness {
        events,
        store,
        transport,
        pipeline,
    }
}

fn count(events: &EventBus, kind: EventKind) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let sink = counter.clone();
    events.on(kind, move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    counter
}

fn image(name: &str, bytes: &[u8]) -> ImageFile {
    ImageFile::new(name, "image/png", bytes.to_vec())
}

#[test]
fn fingerprint_is_truncated_sha256() {
    assert_eq!(fingerprint(b"abc"), "ba7816bf8f");
}

#[tokio::test]
async fn duplicate_upload_skips_transfer() {
    let h = harness();
    let options = UploadOptions::passthrough();

    let first = h.pipeline.upload_file(image("a.png", b"same bytes"), &options).await.unwrap();
    let second = h.pipeline.upload_file(image("b.png", b"same bytes"), &options).await.unwrap();

    assert_eq!(h.transport.transfers.load(Ordering::SeqCst), 1);
    assert_eq!(first.hash, second.hash);
    assert_eq!(first.url, second.url);
    assert_eq!(first.thumbnail_url, second.thumbnail_url);
    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn batch_skips_invalid_file_with_one_error() {
    let h = harness();
    let errors = count(&h.events, EventKind::UploadError);

    let files = vec![
        image("one.png", b"first"),
        ImageFile::new("notes.txt", "text/plain", b"not an image".to_vec()),
        image("three.png", b"third"),
    ];
    let results = h.pipeline.upload_files(files, &UploadOptions::passthrough()).await;

    assert_eq!(results.len(), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.transfers.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn delete_announces_once_and_ignores_unknown_urls() {
    let h = harness();
    let deleted = count(&h.events, EventKind::ImageDeleted);

    let uploaded = h.pipeline.upload_file(image("a.png", b"delete me"), &UploadOptions::passthrough()).await.unwrap();

    assert!(h.pipeline.delete_image(&uploaded.url, &uploaded.delete_token).await);
    assert_eq!(deleted.load(Ordering::SeqCst), 1);
    assert!(h.store.is_empty());

    // Already gone locally: the host call still happens, the gallery is untouched
    assert!(h.pipeline.delete_image(&uploaded.url, &uploaded.delete_token).await);
    assert_eq!(deleted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn staged_upload_releases_previews_once() {
    let h = harness();
    let registry = PreviewRegistry::new();
    let staging = StagingStore::new(registry.clone());

    let ids = staging.add_images(vec![image("a.png", b"alpha"), image("b.png", b"beta"), image("c.png", b"gamma")]);
    staging.update_selected(&ids[2], false);
    staging.update_custom_name(&ids[0], "holiday");

    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = names.clone();
    h.events.on(EventKind::UploadSuccess, move |event| {
        if let UploadEvent::Success(info) = event {
            sink.lock().push(info.display_name().to_string());
        }
    });

    let results = h.pipeline.upload_staged(&staging, &UploadOptions::passthrough()).await;

    assert_eq!(results.len(), 2);
    assert_eq!(*names.lock(), vec!["holiday".to_string(), "b.png".to_string()]);
    assert_eq!(staging.len(), 1);
    assert_eq!(registry.revoked_count(), 2);

    staging.clear_images();
    assert_eq!(registry.revoked_count(), 3);
    assert_eq!(registry.live_count(), 0);
}
