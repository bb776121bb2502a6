//! Image decoding from paths, raw bytes and base64 / data-URL strings.

use crate::types::Image;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound on encoded payload size.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image payload is empty")]
    NoData,
    #[error("image payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("not a decodable image: {0}")]
    Malformed(#[from] image::ImageError),
    #[error("decoded image has zero size")]
    ZeroSize,
}

/// Where an image comes from.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Encoded image file on disk. The caller owns the file.
    Path(PathBuf),
    /// Encoded image bytes; a leading `data:` marker means base64 text.
    Bytes(Vec<u8>),
    /// Base64 text, optionally prefixed with `data:<media-type>;base64,`.
    Encoded(String),
    /// Pixels that are already decoded, e.g. video frames.
    Decoded(Image),
}

impl From<&Path> for ImageInput {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<String> for ImageInput {
    fn from(text: String) -> Self {
        Self::Encoded(text)
    }
}

impl From<Image> for ImageInput {
    fn from(image: Image) -> Self {
        Self::Decoded(image)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDecoder {
    max_bytes: usize,
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_BYTES)
    }
}

impl ImageDecoder {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn decode(&self, input: &ImageInput) -> Result<Image, DecodeError> {
        match input {
            ImageInput::Path(path) => {
                let bytes = std::fs::read(path).map_err(|source| DecodeError::Io {
                    path: path.clone(),
                    source,
                })?;
                self.decode_raw(&bytes)
            }
            ImageInput::Bytes(bytes) if looks_like_base64_text(bytes) => {
                self.decode_text(&String::from_utf8_lossy(bytes))
            }
            ImageInput::Bytes(bytes) => self.decode_raw(bytes),
            ImageInput::Encoded(text) => self.decode_text(text),
            ImageInput::Decoded(image) => check_size(image.clone()),
        }
    }

    /// Like [`decode`](Self::decode), but moves already-decoded pixels.
    pub fn decode_owned(&self, input: ImageInput) -> Result<Image, DecodeError> {
        match input {
            ImageInput::Decoded(image) => check_size(image),
            other => self.decode(&other),
        }
    }

    fn decode_text(&self, text: &str) -> Result<Image, DecodeError> {
        let payload: String = strip_data_url(text)
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        // base64 inflates by 4/3; reject before allocating the decoded buffer
        if payload.len() / 4 * 3 > self.max_bytes {
            return Err(DecodeError::TooLarge {
                size: payload.len() / 4 * 3,
                limit: self.max_bytes,
            });
        }
        let bytes = STANDARD.decode(payload.as_bytes())?;
        self.decode_raw(&bytes)
    }

    fn decode_raw(&self, bytes: &[u8]) -> Result<Image, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::NoData);
        }
        if bytes.len() > self.max_bytes {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        check_size(image::load_from_memory(bytes)?.to_rgb8())
    }
}

fn check_size(image: Image) -> Result<Image, DecodeError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(DecodeError::ZeroSize);
    }
    Ok(image)
}

/// Decode with the default size limit.
pub fn decode_image(input: &ImageInput) -> Result<Image, DecodeError> {
    ImageDecoder::default().decode(input)
}

/// Drop a `data:<media-type>;base64,` (or any `data:...,`) prefix.
fn strip_data_url(text: &str) -> &str {
    let text = text.trim();
    if let Some((_, rest)) = text.split_once("base64,") {
        return rest;
    }
    if text.starts_with("data:") {
        if let Some((_, rest)) = text.split_once(',') {
            return rest;
        }
    }
    text
}

/// Raw bytes that are really base64 text: a data URL, or printable base64
/// alphabet that no image format recognizes.
fn looks_like_base64_text(bytes: &[u8]) -> bool {
    if bytes.starts_with(b"data:") {
        return true;
    }
    image::guess_format(bytes).is_err()
        && bytes.len() >= 8
        && bytes.iter().all(|&b| {
            b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=') || b.is_ascii_whitespace()
        })
}
