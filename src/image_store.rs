//! Persisted gallery of committed images
//!
//! Records are kept newest-first. Every mutation writes a snapshot to
//! [`Storage`] under `image-storage`; the snapshot is loaded at construction.
//! Additions emit `upload:success`, removals emit `image:deleted`.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EventBus, UploadEvent};
use crate::models::{ImageCategory, ImageInfo, NewImage};
use crate::storage::{CATEGORY_STORAGE_KEY, IMAGE_STORAGE_KEY, Storage, StorageError};
use crate::utils::{DEFAULT_ID_LENGTH, generate_id};

/// Id of the category that can never be deleted
pub const DEFAULT_CATEGORY_ID: &str = "default";

/// Errors for image store operations
#[derive(Error, Debug)]
pub enum ImageStoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Category \"{0}\" already exists")]
    CategoryExists(String),

    #[error("The default category cannot be deleted")]
    ProtectedCategory,

    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("An image with id {0} is already stored")]
    DuplicateImage(String),
}

/// Result type for image store operations
pub type ImageStoreResult<T> = Result<T, ImageStoreError>;

fn default_categories() -> Vec<ImageCategory> {
    vec![
        ImageCategory {
            id: DEFAULT_CATEGORY_ID.to_string(),
            name: "Default".to_string(),
            description: Some("Default image category".to_string()),
        },
        ImageCategory {
            id: "screenshots".to_string(),
            name: "Screenshots".to_string(),
            description: Some("Screen captures".to_string()),
        },
        ImageCategory {
            id: "avatars".to_string(),
            name: "Avatars".to_string(),
            description: Some("Profile pictures".to_string()),
        },
    ]
}

/// Ordered, persisted collection of [`ImageInfo`]
pub struct ImageStore {
    images: RwLock<Vec<ImageInfo>>,
    categories: RwLock<Vec<ImageCategory>>,
    storage: Storage,
    events: Arc<EventBus>,
}

impl ImageStore {
    /// Load the store from `storage`
    pub fn new(storage: Storage, events: Arc<EventBus>) -> ImageStoreResult<Self> {
        let images: Vec<ImageInfo> = storage.load(IMAGE_STORAGE_KEY)?.unwrap_or_default();
        let categories = storage
            .load(CATEGORY_STORAGE_KEY)?
            .unwrap_or_else(default_categories);
        info!("Loaded {} images from storage", images.len());

        Ok(Self {
            images: RwLock::new(images),
            categories: RwLock::new(categories),
            storage,
            events,
        })
    }

    /// Commit a record at the front of the collection.
    ///
    /// The given id is kept; a missing or empty id is replaced by a generated one.
    /// An id that is already present is refused.
    pub fn add_image(&self, image: NewImage) -> ImageStoreResult<ImageInfo> {
        let id = match image.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_id(DEFAULT_ID_LENGTH),
        };
        let info = image.into_info(id);

        {
            let mut images = self.images.write();
            if images.iter().any(|existing| existing.id == info.id) {
                return Err(ImageStoreError::DuplicateImage(info.id));
            }
            let mut next = Vec::with_capacity(images.len() + 1);
            next.push(info.clone());
            next.extend(images.iter().cloned());
            self.replace_images(&mut images, next)?;
        }
        debug!(id = %info.id, filename = %info.filename, "Committed image");

        self.events.emit(UploadEvent::Success(info.clone()));
        Ok(info)
    }

    /// Remove a record by id. Absent ids are a no-op and emit nothing
    pub fn remove_image(&self, id: &str) -> ImageStoreResult<Option<ImageInfo>> {
        let removed = {
            let mut images = self.images.write();
            match images.iter().position(|image| image.id == id) {
                Some(idx) => {
                    let mut next = images.clone();
                    let removed = next.remove(idx);
                    self.replace_images(&mut images, next)?;
                    Some(removed)
                }
                None => None,
            }
        };

        if let Some(image) = &removed {
            debug!(id = %image.id, "Removed image");
            self.events.emit(UploadEvent::Deleted(image.clone()));
        }
        Ok(removed)
    }

    /// Drop every record. Known fingerprints are left untouched
    pub fn clear_images(&self) -> ImageStoreResult<()> {
        let mut images = self.images.write();
        self.replace_images(&mut images, Vec::new())?;
        info!("Cleared image store");
        Ok(())
    }

    /// Newest-first copy of every record
    pub fn images(&self) -> Vec<ImageInfo> {
        self.images.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<ImageInfo> {
        self.images.read().iter().find(|image| image.id == id).cloned()
    }

    pub fn find_by_url(&self, url: &str) -> Option<ImageInfo> {
        self.images.read().iter().find(|image| image.url == url).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.images.read().iter().any(|image| image.id == id)
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }

    /// Records filed under `category_id`
    pub fn images_in_category(&self, category_id: &str) -> Vec<ImageInfo> {
        self.images
            .read()
            .iter()
            .filter(|image| image.category_id.as_deref() == Some(category_id))
            .cloned()
            .collect()
    }

    /// File an image under a category (or none). Returns false for an unknown image id
    pub fn set_category(&self, id: &str, category_id: Option<&str>) -> ImageStoreResult<bool> {
        if let Some(category_id) = category_id {
            if !self.categories.read().iter().any(|c| c.id == category_id) {
                return Err(ImageStoreError::UnknownCategory(category_id.to_string()));
            }
        }

        let mut images = self.images.write();
        let Some(idx) = images.iter().position(|image| image.id == id) else {
            return Ok(false);
        };
        let mut next = images.clone();
        next[idx].category_id = category_id.map(str::to_string);
        self.replace_images(&mut images, next)?;
        Ok(true)
    }

    pub fn categories(&self) -> Vec<ImageCategory> {
        self.categories.read().clone()
    }

    /// Create a category; names must be unique
    pub fn add_category(
        &self,
        name: impl Into<String>,
        description: Option<String>,
    ) -> ImageStoreResult<ImageCategory> {
        let name = name.into();
        let mut categories = self.categories.write();
        if categories.iter().any(|c| c.name == name) {
            return Err(ImageStoreError::CategoryExists(name));
        }

        let category = ImageCategory {
            id: generate_id(DEFAULT_ID_LENGTH),
            name,
            description,
        };
        let mut next = categories.clone();
        next.push(category.clone());
        self.storage.save(CATEGORY_STORAGE_KEY, &next)?;
        *categories = next;
        Ok(category)
    }

    /// Delete a category. Images filed under it fall back to no category
    pub fn delete_category(&self, id: &str) -> ImageStoreResult<bool> {
        if id == DEFAULT_CATEGORY_ID {
            return Err(ImageStoreError::ProtectedCategory);
        }

        {
            let mut categories = self.categories.write();
            let next: Vec<ImageCategory> = categories.iter().filter(|c| c.id != id).cloned().collect();
            if next.len() == categories.len() {
                return Ok(false);
            }
            self.storage.save(CATEGORY_STORAGE_KEY, &next)?;
            *categories = next;
        }

        let mut images = self.images.write();
        if images.iter().any(|i| i.category_id.as_deref() == Some(id)) {
            let mut next = images.clone();
            for image in next.iter_mut().filter(|i| i.category_id.as_deref() == Some(id)) {
                image.category_id = None;
            }
            warn!(category = id, "Unfiling images from deleted category");
            self.replace_images(&mut images, next)?;
        }
        Ok(true)
    }

    /// Persist `next`, then make it the live collection. On a failed save the
    /// live collection is left as it was.
    fn replace_images(&self, live: &mut Vec<ImageInfo>, next: Vec<ImageInfo>) -> ImageStoreResult<()> {
        self.storage.save(IMAGE_STORAGE_KEY, &next)?;
        *live = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use parking_lot::Mutex;

    fn new_image(id: Option<&str>, filename: &str) -> NewImage {
        NewImage {
            id: id.map(str::to_string),
            url: format!("https://img/{}", filename),
            thumbnail_url: format!("https://img/thumbnails/{}", filename),
            filename: filename.to_string(),
            custom_name: None,
            size: 42,
            width: None,
            height: None,
            format: None,
            upload_time: 1,
            delete_token: "token".to_string(),
            category_id: None,
            remote_id: None,
        }
    }

    fn store() -> (ImageStore, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let store = ImageStore::new(Storage::in_memory().unwrap(), events.clone()).unwrap();
        (store, events)
    }

    fn record(events: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<UploadEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.on(kind, move |e| sink.lock().push(e.clone()));
        seen
    }

    #[test]
    fn test_add_prepends_and_emits_success() {
        let (store, events) = store();
        let successes = record(&events, EventKind::UploadSuccess);

        store.add_image(new_image(Some("aaaaaaaaaa"), "a.png")).unwrap();
        let second = store.add_image(new_image(None, "b.png")).unwrap();

        assert_eq!(second.id.len(), DEFAULT_ID_LENGTH);
        let ids: Vec<String> = store.images().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second.id.clone(), "aaaaaaaaaa".to_string()]);
        assert_eq!(successes.lock().len(), 2);
    }

    #[test]
    fn test_remove_emits_exactly_one_deleted_event() {
        let (store, events) = store();
        let deleted = record(&events, EventKind::ImageDeleted);
        let added = store.add_image(new_image(Some("aaaaaaaaaa"), "a.png")).unwrap();

        let removed = store.remove_image("aaaaaaaaaa").unwrap();
        assert_eq!(removed.as_ref(), Some(&added));
        assert!(store.is_empty());
        assert_eq!(*deleted.lock(), vec![UploadEvent::Deleted(added)]);

        assert_eq!(store.remove_image("aaaaaaaaaa").unwrap(), None);
        assert_eq!(deleted.lock().len(), 1);
    }

    #[test]
    fn test_state_survives_reload() {
        let storage = Storage::in_memory().unwrap();
        let events = Arc::new(EventBus::new());
        {
            let store = ImageStore::new(storage.clone(), events.clone()).unwrap();
            store.add_image(new_image(Some("1111111111"), "old.png")).unwrap();
            store.add_image(new_image(Some("2222222222"), "new.png")).unwrap();
            store.remove_image("1111111111").unwrap();
        }

        let reloaded = ImageStore::new(storage, events).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("2222222222").unwrap().filename, "new.png");
        assert!(reloaded.find_by_url("https://img/new.png").is_some());
    }

    #[test]
    fn test_add_refuses_an_existing_id() {
        let (store, events) = store();
        let successes = record(&events, EventKind::UploadSuccess);
        store.add_image(new_image(Some("aaaaaaaaaa"), "a.png")).unwrap();

        assert!(matches!(
            store.add_image(new_image(Some("aaaaaaaaaa"), "again.png")),
            Err(ImageStoreError::DuplicateImage(id)) if id == "aaaaaaaaaa"
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("aaaaaaaaaa").unwrap().filename, "a.png");
        assert_eq!(successes.lock().len(), 1);
    }

    #[test]
    fn test_failed_save_leaves_memory_untouched() {
        let storage = Storage::in_memory().unwrap();
        let events = Arc::new(EventBus::new());
        let successes = record(&events, EventKind::UploadSuccess);
        let deleted = record(&events, EventKind::ImageDeleted);
        let store = ImageStore::new(storage.clone(), events).unwrap();
        store.add_image(new_image(Some("aaaaaaaaaa"), "a.png")).unwrap();
        storage.reject_writes();

        assert!(matches!(
            store.add_image(new_image(Some("bbbbbbbbbb"), "b.png")),
            Err(ImageStoreError::Storage(_))
        ));
        assert!(!store.contains("bbbbbbbbbb"));

        assert!(store.remove_image("aaaaaaaaaa").is_err());
        assert!(store.contains("aaaaaaaaaa"));

        assert!(store.clear_images().is_err());
        assert!(store.set_category("aaaaaaaaaa", Some("avatars")).is_err());
        assert_eq!(store.get("aaaaaaaaaa").unwrap().category_id, None);
        assert!(store.add_category("Holidays", None).is_err());
        assert_eq!(store.categories().len(), 3);

        assert_eq!(store.len(), 1);
        assert_eq!(successes.lock().len(), 1);
        assert!(deleted.lock().is_empty());
    }

    #[test]
    fn test_clear_images() {
        let (store, _) = store();
        store.add_image(new_image(None, "a.png")).unwrap();
        store.clear_images().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_categories() {
        let (store, _) = store();
        assert_eq!(store.categories().len(), 3);

        let holidays = store.add_category("Holidays", None).unwrap();
        assert!(matches!(
            store.add_category("Holidays", None),
            Err(ImageStoreError::CategoryExists(_))
        ));

        let image = store.add_image(new_image(None, "beach.png")).unwrap();
        assert!(store.set_category(&image.id, Some(&holidays.id)).unwrap());
        assert_eq!(store.images_in_category(&holidays.id).len(), 1);
        assert!(matches!(
            store.set_category(&image.id, Some("nope")),
            Err(ImageStoreError::UnknownCategory(_))
        ));

        assert!(store.delete_category(&holidays.id).unwrap());
        assert!(!store.delete_category(&holidays.id).unwrap());
        assert_eq!(store.get(&image.id).unwrap().category_id, None);
        assert!(matches!(
            store.delete_category(DEFAULT_CATEGORY_ID),
            Err(ImageStoreError::ProtectedCategory)
        ));
    }
}
