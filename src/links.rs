//! Shareable link generation for hosted images

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::filename_from_url;

/// Text formats a link can be rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFormat {
    Url,
    Markdown,
    Html,
    BbCode,
}

impl LinkFormat {
    pub const ALL: [LinkFormat; 4] = [
        LinkFormat::Url,
        LinkFormat::Markdown,
        LinkFormat::Html,
        LinkFormat::BbCode,
    ];
}

impl fmt::Display for LinkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkFormat::Url => "URL",
            LinkFormat::Markdown => "Markdown",
            LinkFormat::Html => "HTML",
            LinkFormat::BbCode => "BBCode",
        };
        f.write_str(name)
    }
}

/// Server-side renditions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageVariant {
    #[default]
    Original,
    Thumbnail,
    Medium,
}

/// URL of `variant` for an image hosted at `image_url`.
///
/// Thumbnails live under `{base}/t/` and medium renditions under `{base}/m/`;
/// the original URL is returned untouched.
pub fn variant_url(base_url: &str, image_url: &str, variant: ImageVariant) -> String {
    let base = base_url.trim_end_matches('/');
    let name = filename_from_url(image_url);
    match variant {
        ImageVariant::Original => image_url.to_string(),
        ImageVariant::Thumbnail => format!("{}/t/{}", base, name),
        ImageVariant::Medium => format!("{}/m/{}", base, name),
    }
}

/// Render `image_url` in `format`, using `alt` as the alternative text
pub fn generate_link(image_url: &str, format: LinkFormat, alt: &str) -> String {
    match format {
        LinkFormat::Url => image_url.to_string(),
        LinkFormat::Markdown => format!("![{}]({})", alt, image_url),
        LinkFormat::Html => format!("<img src=\"{}\" alt=\"{}\" />", image_url, alt),
        LinkFormat::BbCode => format!("[img]{}[/img]", image_url),
    }
}

/// Every link format for one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageLinks {
    pub direct: String,
    pub markdown: String,
    pub html: String,
    pub bbcode: String,
}

/// All formats at once; the alt text is the URL's file name
pub fn generate_image_links(image_url: &str) -> ImageLinks {
    let alt = filename_from_url(image_url);
    ImageLinks {
        direct: generate_link(image_url, LinkFormat::Url, alt),
        markdown: generate_link(image_url, LinkFormat::Markdown, alt),
        html: generate_link(image_url, LinkFormat::Html, alt),
        bbcode: generate_link(image_url, LinkFormat::BbCode, alt),
    }
}
