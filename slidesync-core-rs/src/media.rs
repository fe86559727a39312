//! Inline image payloads (`data:` URIs)

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("not a data URI")]
    NotDataUri,

    #[error("only base64 data URIs are supported")]
    NotBase64,

    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to read image: {0}")]
    Io(#[from] io::Error),
}

/// A decoded `data:<mime>;base64,<payload>` image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl DataUri {
    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            bytes,
        }
    }

    /// Read an image file, guessing its MIME type from the extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MediaError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        Ok(Self::new(mime_for_path(path), bytes))
    }

    /// Parse a data URI string
    pub fn parse(uri: &str) -> Result<Self, MediaError> {
        let rest = uri.strip_prefix("data:").ok_or(MediaError::NotDataUri)?;
        let (header, payload) = rest.split_once(',').ok_or(MediaError::NotDataUri)?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or(MediaError::NotBase64)?;
        let mime = if mime.is_empty() {
            "text/plain"
        } else {
            mime
        };

        Ok(Self::new(mime, STANDARD.decode(payload.trim())?))
    }

    /// Encode as a data URI string suitable for a slot
    pub fn encode(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }

    /// File extension matching the MIME type
    pub fn extension(&self) -> &'static str {
        match self.mime.as_str() {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/svg+xml" => "svg",
            "image/bmp" => "bmp",
            _ => "bin",
        }
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}
