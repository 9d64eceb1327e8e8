//! Data model shared by the stores and the upload pipeline

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A user-supplied image file: the bytes plus the metadata a browser `File` would carry
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl ImageFile {
    /// Create a file from raw parts
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk, inferring the MIME type from its extension
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let mime_type = mime_from_extension(&name).to_string();

        Ok(Self::new(name, mime_type, bytes))
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Whether the declared MIME type is in the `image/` category
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Guess a MIME type from a file name's extension
pub fn mime_from_extension(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        Some("avif") => "image/avif",
        _ => "application/octet-stream",
    }
}

/// Free-form metadata carried with an upload call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Display name for a single-file upload
    pub custom_name: Option<String>,
    /// Display names for a batch, keyed by the file's index in the input
    #[serde(default)]
    pub custom_names: BTreeMap<usize, String>,
    pub category_id: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ImageMetadata {
    /// Resolve the display name for the file at `index` of a batch
    pub fn name_for(&self, index: usize) -> Option<&str> {
        self.custom_names
            .get(&index)
            .or(self.custom_name.as_ref())
            .map(String::as_str)
    }
}

/// Per-call processing and naming options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadOptions {
    pub remove_exif: bool,
    pub add_watermark: bool,
    pub watermark_text: String,
    pub generate_thumbnail: bool,
    /// Advisory bound; used as the thumbnail ceiling
    pub max_width: u32,
    /// Advisory bound; used as the thumbnail ceiling
    pub max_height: u32,
    #[serde(skip)]
    pub metadata: ImageMetadata,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            remove_exif: true,
            add_watermark: false,
            watermark_text: String::new(),
            generate_thumbnail: true,
            max_width: 1920,
            max_height: 1080,
            metadata: ImageMetadata::default(),
        }
    }
}

impl UploadOptions {
    /// Options with every processing stage turned off
    pub fn passthrough() -> Self {
        Self {
            remove_exif: false,
            add_watermark: false,
            generate_thumbnail: false,
            ..Self::default()
        }
    }

    pub fn with_custom_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.custom_name = Some(name.into());
        self
    }

    pub fn with_custom_names(mut self, names: BTreeMap<usize, String>) -> Self {
        self.metadata.custom_names = names;
        self
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.metadata.category_id = Some(category_id.into());
        self
    }

    pub fn with_watermark(mut self, text: impl Into<String>) -> Self {
        self.add_watermark = true;
        self.watermark_text = text.into();
        self
    }
}

/// What the pipeline returns for each uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub url: String,
    pub thumbnail_url: String,
    pub delete_token: String,
    pub hash: String,
    /// The content was already known and nothing was transferred
    #[serde(default)]
    pub deduplicated: bool,
}

/// A committed, persisted image record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub id: String,
    pub url: String,
    pub thumbnail_url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub upload_time: i64,
    pub delete_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    /// Identifier the host assigned on upload, used to address deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl ImageInfo {
    /// The name shown to users: the custom name when set, else the original filename
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.filename)
    }
}

/// A record about to be committed; the store assigns an id when none is given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub id: Option<String>,
    pub url: String,
    pub thumbnail_url: String,
    pub filename: String,
    pub custom_name: Option<String>,
    pub size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub upload_time: i64,
    pub delete_token: String,
    pub category_id: Option<String>,
    pub remote_id: Option<String>,
}

impl NewImage {
    pub fn into_info(self, id: String) -> ImageInfo {
        ImageInfo {
            id,
            url: self.url,
            thumbnail_url: self.thumbnail_url,
            filename: self.filename,
            custom_name: self.custom_name,
            size: self.size,
            width: self.width,
            height: self.height,
            format: self.format,
            upload_time: self.upload_time,
            delete_token: self.delete_token,
            category_id: self.category_id,
            remote_id: self.remote_id,
        }
    }
}

/// Gallery category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCategory {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_from_extension("cat.PNG"), "image/png");
        assert_eq!(mime_from_extension("a.b.jpeg"), "image/jpeg");
        assert_eq!(mime_from_extension("notes.txt"), "application/octet-stream");
        assert_eq!(mime_from_extension("noext"), "application/octet-stream");
    }

    #[test]
    fn test_metadata_name_resolution() {
        let mut names = BTreeMap::new();
        names.insert(2, "third".to_string());
        let metadata = ImageMetadata {
            custom_name: Some("fallback".to_string()),
            custom_names: names,
            ..Default::default()
        };

        assert_eq!(metadata.name_for(2), Some("third"));
        assert_eq!(metadata.name_for(0), Some("fallback"));
        assert_eq!(ImageMetadata::default().name_for(0), None);
    }

    #[test]
    fn test_image_info_serializes_camel_case() {
        let info = ImageInfo {
            id: "0123456789".to_string(),
            url: "https://img/0123456789".to_string(),
            thumbnail_url: "https://img/thumbnails/0123456789".to_string(),
            filename: "cat.png".to_string(),
            custom_name: None,
            size: 10,
            width: Some(4),
            height: None,
            format: None,
            upload_time: 1,
            delete_token: "tok".to_string(),
            category_id: None,
            remote_id: Some("srv-1".to_string()),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("thumbnailUrl").is_some());
        assert_eq!(json["remoteId"], "srv-1");
        assert!(json.get("uploadTime").is_some());
        assert!(json.get("customName").is_none());
        assert_eq!(info.display_name(), "cat.png");
    }

    #[test]
    fn test_records_without_remote_id_still_load() {
        let json = r#"{"id":"0123456789","url":"u","thumbnailUrl":"t","filename":"cat.png",
            "size":1,"uploadTime":1,"deleteToken":"tok"}"#;
        let info: ImageInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.remote_id, None);
    }
}
