use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use tracing::{info, trace};

use imghost::api::ApiClient;
use imghost::cli::{CliContext, CliError, run_cli};
use imghost::logger::{Logger, OperationStatus};
use imghost::{
    AuthStore, EventBus, EventKind, HashCache, HashEngine, HttpTransport, ImageStore, PipelineSettings,
    PreviewRegistry, SimulatedTransport, StagingStore, Storage, Transport, UploadEvent, UploadPipeline,
    init_config, init_logger,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config_manager = init_config(".").context("Failed to load config.toml")?;
    let config = config_manager.get_app_config()?;

    let logger = Arc::new(init_logger(&config).context("Failed to initialize logging")?);
    log_system_information(&logger);

    std::fs::create_dir_all(&config.paths.data_directory)
        .with_context(|| format!("Failed to create {}", config.paths.data_directory))?;
    let storage = Storage::open(&config.paths.database_file)?;
    let events = Arc::new(EventBus::new());
    forward_events_to_log(&events, &logger);

    let cache = if config.hashing.persist_cache {
        HashCache::with_storage(storage.clone())?
    } else {
        HashCache::new()
    };
    let cache = Arc::new(cache);
    let hasher = if config.hashing.use_worker {
        HashEngine::new(cache)
    } else {
        HashEngine::inline(cache)
    };

    let store = Arc::new(ImageStore::new(storage.clone(), events.clone())?);
    let auth = Arc::new(AuthStore::new(storage, events.clone())?);
    let staging = Arc::new(StagingStore::new(PreviewRegistry::new()));

    let api = if config.uses_remote_api() {
        Some(Arc::new(ApiClient::new(&config.api)?.with_auth(auth.clone())))
    } else {
        None
    };

    let transport: Arc<dyn Transport> = if let Some(client) = &api {
        Arc::new(HttpTransport::new(client.clone()))
    } else {
        info!("No API base_url configured, uploads are simulated");
        Arc::new(SimulatedTransport::new(
            Duration::from_millis(config.upload.simulated_latency_ms),
            Duration::from_millis(config.upload.simulated_tick_ms),
        ))
    };

    let pipeline = Arc::new(UploadPipeline::new(
        Arc::new(hasher),
        store.clone(),
        events.clone(),
        transport,
        PipelineSettings::from_config(&config),
    )?);

    let ctx = CliContext {
        events,
        staging,
        store,
        auth,
        pipeline,
        api,
        upload_defaults: config.upload.defaults.clone(),
    };

    match run_cli(ctx).await {
        Ok(()) | Err(CliError::NotInteractive) => {}
        Err(e) => {
            logger.log_error("cli", &e.to_string(), None);
            return Err(e.into());
        }
    }

    logger.log_system_event("shutdown", "imghost exited normally");
    Ok(())
}

/// Mirrors bus events into the operation log
fn forward_events_to_log(events: &EventBus, logger: &Arc<Logger>) {
    let log = logger.clone();
    events.on(EventKind::UploadSuccess, move |event| {
        if let UploadEvent::Success(image) = event {
            log.log_upload(&image.filename, Some(image.id.as_str()), OperationStatus::Completed, Some(image.size));
        }
    });

    let log = logger.clone();
    events.on(EventKind::UploadDeduplicated, move |event| {
        if let UploadEvent::Deduplicated { filename, hash } = event {
            log.log_dedup(filename, hash);
        }
    });

    let log = logger.clone();
    events.on(EventKind::ImageDeleted, move |event| {
        if let UploadEvent::Deleted(image) = event {
            log.log_delete(&image.url, OperationStatus::Completed);
        }
    });

    let log = logger.clone();
    events.on(EventKind::UploadError, move |event| {
        if let UploadEvent::Error(message) = event {
            log.log_error("upload", message, None);
        }
    });
}

/// Logs important information about the system being used.
fn log_system_information(logger: &Logger) {
    trace!(arch = std::env::consts::ARCH, os = std::env::consts::OS, family = std::env::consts::FAMILY);
    logger.log_system_event(
        "startup",
        &format!("imghost {} starting, logs in {}", env!("CARGO_PKG_VERSION"), logger.log_dir().display()),
    );
}
