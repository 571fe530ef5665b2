//! Image preprocessing collaborator.
//!
//! The orchestrator treats image handling as a black box: bytes in, an
//! encoded image out. The default implementation only checks the format
//! and base64-encodes; decoding and enhancement are out of scope.

use base64::Engine;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,

    #[error("unsupported image format (expected JPEG or PNG)")]
    UnsupportedFormat,

    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else {
            None
        }
    }
}

/// An image ready to send to the recognition tool
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub format: ImageFormat,
    pub base64: String,
    /// Size of the original bytes
    pub byte_len: usize,
}

pub trait ImagePreprocessor: Send + Sync {
    fn preprocess(&self, bytes: &[u8]) -> Result<EncodedImage, ImageError>;
}

/// Format check plus standard base64
pub struct Base64Encoder {
    max_bytes: usize,
}

impl Base64Encoder {
    /// 20 MiB
    pub const DEFAULT_MAX_BYTES: usize = 20 * 1024 * 1024;

    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Default for Base64Encoder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_BYTES)
    }
}

impl ImagePreprocessor for Base64Encoder {
    fn preprocess(&self, bytes: &[u8]) -> Result<EncodedImage, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(ImageError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        let format = ImageFormat::sniff(bytes).ok_or(ImageError::UnsupportedFormat)?;
        Ok(EncodedImage {
            format,
            base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            byte_len: bytes.len(),
        })
    }
}
