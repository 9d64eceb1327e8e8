//! In-process event bus
//!
//! Decouples the upload pipeline and the stores from whatever renders their
//! state. Events are a tagged union, so payload shapes are checked at compile
//! time; handlers are registered per [`EventKind`].
//!
//! Handlers run synchronously, in subscription order, inside [`EventBus::emit`].
//! A handler that panics is caught and logged; the remaining handlers for the
//! same emission still run. Async consumers can use [`EventBus::subscribe`]
//! instead, which hands out a broadcast receiver.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, trace};

use crate::models::ImageInfo;

/// Capacity of the broadcast channel handed to async subscribers
const BROADCAST_CAPACITY: usize = 256;

/// Named channels carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UploadProgress,
    UploadError,
    UploadSuccess,
    UploadDeduplicated,
    ImageDeleted,
    AuthLogin,
    AuthLogout,
}

impl EventKind {
    /// Wire name of the channel
    pub fn channel(&self) -> &'static str {
        match self {
            EventKind::UploadProgress => "upload:progress",
            EventKind::UploadError => "upload:error",
            EventKind::UploadSuccess => "upload:success",
            EventKind::UploadDeduplicated => "upload:deduplicated",
            EventKind::ImageDeleted => "image:deleted",
            EventKind::AuthLogin => "auth:login",
            EventKind::AuthLogout => "auth:logout",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel())
    }
}

/// Payload of `upload:progress`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub filename: String,
    /// 0..=100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(filename: impl Into<String>, progress: u8) -> Self {
        Self {
            filename: filename.into(),
            progress: progress.min(100),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Everything the bus can carry
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress(ProgressEvent),
    Error(String),
    Success(ImageInfo),
    /// Content was already committed; nothing was transferred
    Deduplicated { filename: String, hash: String },
    Deleted(ImageInfo),
    Login(String),
    Logout(Option<String>),
}

impl UploadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::Progress(_) => EventKind::UploadProgress,
            UploadEvent::Error(_) => EventKind::UploadError,
            UploadEvent::Success(_) => EventKind::UploadSuccess,
            UploadEvent::Deduplicated { .. } => EventKind::UploadDeduplicated,
            UploadEvent::Deleted(_) => EventKind::ImageDeleted,
            UploadEvent::Login(_) => EventKind::AuthLogin,
            UploadEvent::Logout(_) => EventKind::AuthLogout,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
}

/// Typed publish/subscribe bus
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<UploadEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            broadcast_tx,
        }
    }

    /// Register a handler for every event of `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), false)
    }

    /// Register a handler that is removed after its first invocation
    pub fn once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), true)
    }

    /// Remove a handler. Returns false when it was not registered (or already fired, for `once`)
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(subs) = handlers.get_mut(&kind) else {
            return false;
        };

        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        let removed = subs.len() != before;

        if subs.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Number of handlers currently registered for `kind`
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Async receiver of every emitted event
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Deliver `event` to every handler registered for its kind
    pub fn emit(&self, event: UploadEvent) {
        let kind = event.kind();
        trace!(channel = %kind, "emitting event");

        // Snapshot the handlers and drop the lock before invoking them so a
        // handler may subscribe, unsubscribe or emit without deadlocking.
        let to_call: Vec<Handler> = {
            let mut handlers = self.handlers.write();
            match handlers.get_mut(&kind) {
                Some(subs) => {
                    let snapshot = subs.iter().map(|sub| sub.handler.clone()).collect();
                    subs.retain(|sub| !sub.once);
                    if subs.is_empty() {
                        handlers.remove(&kind);
                    }
                    snapshot
                }
                None => Vec::new(),
            }
        };

        for handler in to_call {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if let Err(payload) = outcome {
                error!(
                    channel = %kind,
                    panic = panic_message(&payload),
                    "event handler panicked"
                );
            }
        }

        // No receivers is the normal case for a headless run
        let _ = self.broadcast_tx.send(event);
    }

    /// Shorthand for emitting `upload:progress`
    pub fn progress(&self, event: ProgressEvent) {
        self.emit(UploadEvent::Progress(event));
    }

    /// Shorthand for emitting `upload:error`
    pub fn error(&self, message: impl Into<String>) {
        self.emit(UploadEvent::Error(message.into()));
    }

    fn register(&self, kind: EventKind, handler: Handler, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscription { id, handler, once });
        id
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
