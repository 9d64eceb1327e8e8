//! imghost: client core for a hash-addressed image host
//! Stages local files, fingerprints and processes them, uploads them and keeps a local gallery

pub mod api;
pub mod auth_store;
pub mod cli;
pub mod config_loader;
pub mod events;
pub mod hashing;
pub mod image_store;
pub mod links;
pub mod logger;
pub mod models;
pub mod staging;
pub mod storage;
pub mod upload;
pub mod utils;

// Re-export commonly used types for convenience
pub use config_loader::{AppConfig, ConfigError, ConfigManager, ConfigResult, init_config};

pub use events::{EventBus, EventKind, ProgressEvent, SubscriptionId, UploadEvent};

pub use hashing::{HashCache, HashEngine, HashError, HashOutcome, HashResult, fingerprint};

pub use models::{
    ImageCategory, ImageFile, ImageInfo, ImageMetadata, NewImage, UploadOptions, UploadResult,
};

pub use staging::{PreviewRegistry, StagedImage, StagingStore};

pub use image_store::{ImageStore, ImageStoreError, ImageStoreResult};

pub use auth_store::{AuthSession, AuthStore};

pub use storage::{Storage, StorageError, StorageResult};

pub use upload::{
    PipelineResult, PipelineSettings, UploadError, UploadPipeline,
    transport::{
        DeleteRequest, HttpTransport, SimulatedTransport, TransferReceipt, TransferRequest, Transport, TransportError,
    },
};

pub use links::{ImageLinks, ImageVariant, LinkFormat, generate_image_links, generate_link, variant_url};

pub use logger::{Logger, LoggerError, init_logger};

pub use cli::run_cli;
