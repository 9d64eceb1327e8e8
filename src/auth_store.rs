//! Persisted authentication session
//!
//! The handshake that produces a token happens elsewhere; this store only
//! keeps the resulting session and announces login/logout on the bus.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::{EventBus, UploadEvent};
use crate::storage::{AUTH_STORAGE_KEY, Storage, StorageResult};

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub username: String,
    pub token: String,
}

pub struct AuthStore {
    session: RwLock<Option<AuthSession>>,
    storage: Storage,
    events: Arc<EventBus>,
}

impl AuthStore {
    /// Restore the last session from `storage`, if any
    pub fn new(storage: Storage, events: Arc<EventBus>) -> StorageResult<Self> {
        let session: Option<AuthSession> = storage.load(AUTH_STORAGE_KEY)?;
        if let Some(s) = &session {
            info!("Restored session for {}", s.username);
        }

        Ok(Self {
            session: RwLock::new(session),
            storage,
            events,
        })
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.session.read().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.read().is_some()
    }

    /// Store a new session and emit `auth:login`
    pub fn login(&self, username: impl Into<String>, token: impl Into<String>) -> StorageResult<()> {
        let session = AuthSession {
            username: username.into(),
            token: token.into(),
        };
        self.storage.save(AUTH_STORAGE_KEY, &session)?;
        let username = session.username.clone();
        *self.session.write() = Some(session);

        info!("Logged in as {}", username);
        self.events.emit(UploadEvent::Login(username));
        Ok(())
    }

    /// Drop the session and emit `auth:logout` with the previous username
    pub fn logout(&self) -> StorageResult<()> {
        self.storage.remove(AUTH_STORAGE_KEY)?;
        let previous = self.session.write().take().map(|s| s.username);

        info!("Logged out");
        self.events.emit(UploadEvent::Logout(previous));
        Ok(())
    }
}
