//! Firmware images.

use bytes::Bytes;
use std::path::Path;

use crate::error::{Error, Result};

/// Raw firmware image destined for a channel's flash.
///
/// The image is opaque; the only validation is on its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    data: Bytes,
}

impl Firmware {
    /// Largest image accepted.
    pub const MAX_LEN: usize = 2 * 1024 * 1024;

    /// Wrap an image held in memory.
    pub fn new(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if data.is_empty() {
            return Err(Error::InvalidFirmware("image is empty".to_string()));
        }
        if data.len() > Self::MAX_LEN {
            return Err(Error::InvalidFirmware(format!(
                "image is {} bytes, limit is {}",
                data.len(),
                Self::MAX_LEN
            )));
        }
        Ok(Self { data })
    }

    /// Read an image from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        Self::new(data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(Firmware::new(Vec::new()), Err(Error::InvalidFirmware(_))));
    }

    #[test]
    fn test_oversized_rejected() {
        let image = vec![0u8; Firmware::MAX_LEN + 1];
        assert!(matches!(Firmware::new(image), Err(Error::InvalidFirmware(_))));
    }

    #[test]
    fn test_accepts_image() {
        let image = Firmware::new(vec![0xAA; 32]).unwrap();
        assert_eq!(image.len(), 32);
        assert_eq!(image.as_bytes()[0], 0xAA);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Firmware::load(Path::new("/nonexistent/udaq.bin")).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
