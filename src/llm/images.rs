//! Image inputs.
//!
//! Callers name images by URL, `data:` URL or local path. Local files are
//! read and base64-encoded here; adapters only ever see an [`ImageInput`].

use base64::Engine;
use tracing::debug;
use url::Url;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Url(String),
    Base64 { media_type: String, data: String },
}

/// One image attached to a user message.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    pub source: ImageSource,
    /// Provider hint (`auto`, `low`, `high`), passed through untouched.
    pub detail: String,
}

impl ImageInput {
    /// The image as a URL: remote URLs as-is, inline data as a `data:` URL.
    pub fn as_url(&self) -> String {
        match &self.source {
            ImageSource::Url(url) => url.clone(),
            ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        }
    }
}

/// Resolves an image reference into an [`ImageInput`].
pub async fn load(reference: &str, detail: &str) -> Result<ImageInput, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidImage {
        source_ref: reference.to_string(),
        reason,
    };

    let source = if let Some(rest) = reference.strip_prefix("data:") {
        let (media_type, data) = rest
            .split_once(";base64,")
            .ok_or_else(|| invalid("only base64 data URLs are supported".to_string()))?;
        ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        }
    } else if is_url(reference) {
        ImageSource::Url(reference.to_string())
    } else {
        let media_type = media_type_from_extension(reference)
            .ok_or_else(|| invalid("unsupported image format".to_string()))?;
        let bytes = tokio::fs::read(reference)
            .await
            .map_err(|e| invalid(e.to_string()))?;
        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
        debug!("Encoded image {reference} ({media_type}) as base64 ({} chars)", data.len());
        ImageSource::Base64 {
            media_type: media_type.to_string(),
            data,
        }
    };

    Ok(ImageInput {
        source,
        detail: detail.to_string(),
    })
}

fn is_url(reference: &str) -> bool {
    Url::parse(reference)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

fn media_type_from_extension(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
