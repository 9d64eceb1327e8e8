//! Image processing run before transfer
//!
//! 1. EXIF removal clears the metadata `little_exif` understands for the container
//! 2. Watermarking writes the text into the EXIF `Copyright` tag
//! 3. Thumbnailing decodes with `image` and encodes a bounded PNG preview
//!
//! Every step is pure: it takes the current bytes and returns new ones, so the
//! pipeline can keep the previous bytes when a step fails.

use std::io::Cursor;
use std::panic::{AssertUnwindSafe, catch_unwind};

use bytes::Bytes;
use image::{GenericImageView, ImageFormat};
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use thiserror::Error;

/// Longest edge of a generated thumbnail
pub const THUMBNAIL_EDGE: u32 = 320;

/// Error types for processing steps
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Watermarking is not supported for {0}")]
    UnsupportedFormat(String),

    #[error("Watermark text is empty")]
    EmptyWatermark,

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type for processing steps
pub type ProcessingResult<T> = Result<T, ProcessingError>;

/// Decoded facts about an image plus its thumbnail
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// PNG-encoded preview, no larger than the requested bounds
    pub bytes: Bytes,
}

/// Metadata container for the sniffed format, if it carries EXIF
fn exif_container(bytes: &[u8]) -> Option<FileExtension> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Jpeg => Some(FileExtension::JPEG),
        ImageFormat::Png => Some(FileExtension::PNG { as_zTXt_chunk: true }),
        ImageFormat::WebP => Some(FileExtension::WEBP),
        ImageFormat::Tiff => Some(FileExtension::TIFF),
        _ => None,
    }
}

/// Run a little_exif call, turning both its errors and its panics into [`ProcessingError::Metadata`]
fn guarded<T>(op: impl FnOnce() -> std::io::Result<T>) -> ProcessingResult<T> {
    match catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result.map_err(|e| ProcessingError::Metadata(e.to_string())),
        Err(_) => Err(ProcessingError::Metadata("metadata library panicked".to_string())),
    }
}

/// Remove embedded EXIF metadata. Formats without an EXIF carrier pass through
pub fn strip_exif(bytes: &Bytes) -> ProcessingResult<Bytes> {
    let Some(container) = exif_container(bytes) else {
        return Ok(bytes.clone());
    };

    let mut out = bytes.to_vec();
    guarded(|| Metadata::clear_metadata(&mut out, container))?;
    Ok(Bytes::from(out))
}

/// Embed `text` as the EXIF copyright of the image
pub fn embed_watermark(bytes: &Bytes, text: &str) -> ProcessingResult<Bytes> {
    if text.trim().is_empty() {
        return Err(ProcessingError::EmptyWatermark);
    }

    let Some(container) = exif_container(bytes) else {
        return Err(ProcessingError::UnsupportedFormat(
            image::guess_format(bytes)
                .map(|f| format!("{:?}", f))
                .unwrap_or_else(|_| "unknown format".to_string()),
        ));
    };

    let mut out = bytes.to_vec();
    // Keep whatever the file already carries, the copyright is added on top
    let mut metadata =
        guarded(|| Metadata::new_from_vec(&out, container.clone())).unwrap_or_else(|_| Metadata::new());
    metadata.set_tag(ExifTag::Copyright(text.to_string()));
    guarded(|| metadata.write_to_vec(&mut out, container))?;
    Ok(Bytes::from(out))
}

/// Decode the image and produce a thumbnail bounded by `max_width` x `max_height`
/// (and never larger than [`THUMBNAIL_EDGE`])
pub fn make_thumbnail(bytes: &[u8], max_width: u32, max_height: u32) -> ProcessingResult<Thumbnail> {
    let format = image::guess_format(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = img.dimensions();

    let bound_w = max_width.clamp(1, THUMBNAIL_EDGE);
    let bound_h = max_height.clamp(1, THUMBNAIL_EDGE);
    let thumb = img.thumbnail(bound_w, bound_h);

    let mut encoded = Cursor::new(Vec::new());
    thumb.write_to(&mut encoded, ImageFormat::Png)?;

    Ok(Thumbnail {
        width,
        height,
        format: format_name(format),
        bytes: Bytes::from(encoded.into_inner()),
    })
}

fn format_name(format: ImageFormat) -> String {
    format
        .extensions_str()
        .first()
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| format!("{:?}", format).to_lowercase())
}
