//! Staging area for files picked but not yet uploaded
//!
//! Each staged entry owns a [`PreviewHandle`], a revocable reference into the
//! [`PreviewRegistry`] that serves preview bytes to the UI. The handle revokes
//! its registration when dropped, so removing, clearing or committing an
//! entry releases the preview exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::models::ImageFile;
use crate::utils::{DEFAULT_ID_LENGTH, generate_id};

/// Registry of live preview resources, addressed by `blob:` URLs
#[derive(Default)]
pub struct PreviewRegistry {
    live: DashMap<String, Bytes>,
    allocated: AtomicU64,
    revoked: AtomicU64,
}

impl PreviewRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a preview for `file`
    pub fn allocate(self: &Arc<Self>, file: &ImageFile) -> PreviewHandle {
        let url = format!("blob:imghost/{}", Uuid::new_v4());
        self.live.insert(url.clone(), file.bytes.clone());
        self.allocated.fetch_add(1, Ordering::Relaxed);
        trace!(%url, "allocated preview");

        PreviewHandle {
            url,
            registry: self.clone(),
        }
    }

    /// Bytes behind a live preview URL
    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.live.get(url).map(|entry| entry.value().clone())
    }

    fn revoke(&self, url: &str) {
        if self.live.remove(url).is_some() {
            self.revoked.fetch_add(1, Ordering::Relaxed);
            trace!(%url, "revoked preview");
        }
    }

    /// Previews currently registered
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn revoked_count(&self) -> u64 {
        self.revoked.load(Ordering::Relaxed)
    }
}

/// Owned preview registration, revoked on drop
pub struct PreviewHandle {
    url: String,
    registry: Arc<PreviewRegistry>,
}

impl PreviewHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PreviewHandle").field(&self.url).finish()
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.registry.revoke(&self.url);
    }
}

/// A staged file
#[derive(Debug)]
pub struct StagingImage {
    pub id: String,
    pub file: ImageFile,
    pub preview: PreviewHandle,
    pub custom_name: String,
    pub selected: bool,
}

/// Cloneable view of a staged entry
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub id: String,
    pub file: ImageFile,
    pub preview_url: String,
    pub custom_name: String,
    pub selected: bool,
}

impl From<&StagingImage> for StagedImage {
    fn from(image: &StagingImage) -> Self {
        Self {
            id: image.id.clone(),
            file: image.file.clone(),
            preview_url: image.preview.url().to_string(),
            custom_name: image.custom_name.clone(),
            selected: image.selected,
        }
    }
}

/// In-memory staging collection; every operation is synchronous
pub struct StagingStore {
    images: RwLock<Vec<StagingImage>>,
    previews: Arc<PreviewRegistry>,
}

impl StagingStore {
    pub fn new(previews: Arc<PreviewRegistry>) -> Self {
        Self {
            images: RwLock::new(Vec::new()),
            previews,
        }
    }

    pub fn previews(&self) -> &Arc<PreviewRegistry> {
        &self.previews
    }

    /// Stage a file with an already allocated preview. Returns the entry id
    pub fn add_image(&self, file: ImageFile, preview: PreviewHandle) -> String {
        let mut images = self.images.write();
        let id = Self::unique_id(&images);
        debug!(%id, file = %file.name, "staged image");

        images.push(StagingImage {
            id: id.clone(),
            custom_name: file.name.clone(),
            file,
            preview,
            selected: true,
        });
        id
    }

    /// Stage several files, allocating a preview for each. Returns the new ids in order
    pub fn add_images(&self, files: impl IntoIterator<Item = ImageFile>) -> Vec<String> {
        files
            .into_iter()
            .map(|file| {
                let preview = self.previews.allocate(&file);
                self.add_image(file, preview)
            })
            .collect()
    }

    /// Remove one entry, releasing its preview. Returns false when the id is unknown
    pub fn remove_image(&self, id: &str) -> bool {
        let removed = {
            let mut images = self.images.write();
            images
                .iter()
                .position(|image| image.id == id)
                .map(|idx| images.remove(idx))
        };
        removed.is_some()
    }

    /// Remove every entry, releasing every preview
    pub fn clear_images(&self) {
        let drained: Vec<StagingImage> = std::mem::take(&mut *self.images.write());
        debug!(count = drained.len(), "cleared staging area");
    }

    /// Detach the given entries, in staging order. Dropping them releases their previews
    pub fn take(&self, ids: &[String]) -> Vec<StagingImage> {
        let mut images = self.images.write();
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *images)
            .into_iter()
            .partition(|image| ids.contains(&image.id));
        *images = kept;
        taken
    }

    pub fn update_custom_name(&self, id: &str, custom_name: impl Into<String>) -> bool {
        self.with_entry(id, |image| image.custom_name = custom_name.into())
    }

    pub fn update_selected(&self, id: &str, selected: bool) -> bool {
        self.with_entry(id, |image| image.selected = selected)
    }

    pub fn select_all(&self, selected: bool) {
        for image in self.images.write().iter_mut() {
            image.selected = selected;
        }
    }

    pub fn get(&self, id: &str) -> Option<StagedImage> {
        self.images
            .read()
            .iter()
            .find(|image| image.id == id)
            .map(StagedImage::from)
    }

    pub fn get_images(&self) -> Vec<StagedImage> {
        self.images.read().iter().map(StagedImage::from).collect()
    }

    pub fn get_selected_images(&self) -> Vec<StagedImage> {
        self.images
            .read()
            .iter()
            .filter(|image| image.selected)
            .map(StagedImage::from)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }

    fn with_entry(&self, id: &str, update: impl FnOnce(&mut StagingImage)) -> bool {
        match self.images.write().iter_mut().find(|image| image.id == id) {
            Some(image) => {
                update(image);
                true
            }
            None => false,
        }
    }

    fn unique_id(images: &[StagingImage]) -> String {
        loop {
            let id = generate_id(DEFAULT_ID_LENGTH);
            if !images.iter().any(|image| image.id == id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(n: usize) -> Vec<ImageFile> {
        (0..n)
            .map(|i| ImageFile::new(format!("img{}.png", i), "image/png", vec![i as u8; 8]))
            .collect()
    }

    fn store() -> StagingStore {
        StagingStore::new(PreviewRegistry::new())
    }

    #[test]
    fn test_add_images_defaults() {
        let staging = store();
        let ids = staging.add_images(files(2));

        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        let first = staging.get(&ids[0]).unwrap();
        assert_eq!(first.custom_name, "img0.png");
        assert!(first.selected);
        assert_eq!(
            staging.previews().resolve(&first.preview_url).unwrap().as_ref(),
            &[0u8; 8]
        );
    }

    #[test]
    fn test_remove_releases_preview_once() {
        let staging = store();
        let ids = staging.add_images(files(3));
        let registry = staging.previews().clone();

        assert!(staging.remove_image(&ids[1]));
        assert!(!staging.remove_image(&ids[1]));

        assert_eq!(registry.revoked_count(), 1);
        assert_eq!(registry.live_count(), 2);
        assert!(staging.get(&ids[1]).is_none());
    }

    #[test]
    fn test_clear_releases_every_preview_once() {
        let staging = store();
        let ids = staging.add_images(files(4));
        staging.remove_image(&ids[0]);
        staging.clear_images();
        staging.clear_images();

        let registry = staging.previews();
        assert_eq!(registry.allocated_count(), 4);
        assert_eq!(registry.revoked_count(), 4);
        assert_eq!(registry.live_count(), 0);
        assert!(staging.is_empty());
    }

    #[test]
    fn test_selection_and_rename() {
        let staging = store();
        let ids = staging.add_images(files(3));

        assert!(staging.update_selected(&ids[1], false));
        assert!(staging.update_custom_name(&ids[0], "holiday"));
        assert!(!staging.update_custom_name("missing", "x"));

        let selected = staging.get_selected_images();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].custom_name, "holiday");
        assert_eq!(selected[1].id, ids[2]);

        staging.select_all(false);
        assert!(staging.get_selected_images().is_empty());
        staging.select_all(true);
        assert_eq!(staging.get_selected_images().len(), 3);
    }

    #[test]
    fn test_removed_entry_never_selected() {
        let staging = store();
        let ids = staging.add_images(files(2));
        staging.remove_image(&ids[0]);

        assert!(staging.get_selected_images().iter().all(|img| img.id != ids[0]));
    }

    #[test]
    fn test_take_detaches_in_order() {
        let staging = store();
        let ids = staging.add_images(files(3));

        let taken = staging.take(&[ids[2].clone(), ids[0].clone()]);
        assert_eq!(taken.iter().map(|t| t.id.clone()).collect::<Vec<_>>(), vec![ids[0].clone(), ids[2].clone()]);
        assert_eq!(staging.len(), 1);
        assert_eq!(staging.previews().revoked_count(), 0);

        drop(taken);
        assert_eq!(staging.previews().revoked_count(), 2);
    }
}
