//! Crop storage: JPEG files sharded under `<data_dir>/crops/NNN/<id>.jpg`
//! where `NNN` is `id / 1000`. Writes are staged into `crops/tmp/` and
//! renamed into place once the owning event's id is assigned, so a file
//! only ever appears under its final name fully written.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use mirador_core::CropCandidate;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const JPEG_QUALITY: u8 = 85;
const WRITE_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum CropError {
    #[error("failed to encode crop: {0}")]
    Encode(#[from] image::ImageError),
    #[error("unsupported crop channel count {0}")]
    Channels(u8),
    #[error("crop i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone)]
pub struct CropStore {
    root: PathBuf,
}

impl CropStore {
    /// `root` is the data directory; crops live in `<root>/crops`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn crops_dir(&self) -> PathBuf {
        self.root.join("crops")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.crops_dir().join("tmp")
    }

    pub fn ensure_dirs(&self) -> Result<(), CropError> {
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }

    /// Encode a crop candidate as JPEG.
    pub fn encode_jpeg(crop: &CropCandidate) -> Result<Vec<u8>, CropError> {
        let color = match crop.channels {
            1 => ExtendedColorType::L8,
            3 => ExtendedColorType::Rgb8,
            other => return Err(CropError::Channels(other)),
        };
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode(
            &crop.pixels,
            crop.width,
            crop.height,
            color,
        )?;
        Ok(out)
    }

    /// Write encoded bytes to a uniquely-named staging file, retrying
    /// transient failures with a short backoff. Returns the staged path.
    pub async fn stage(&self, jpeg: Vec<u8>) -> Result<PathBuf, CropError> {
        let staged = self.tmp_dir().join(format!("{}.jpg", Uuid::new_v4()));
        let mut attempt = 0;
        loop {
            match tokio::fs::write(&staged, &jpeg).await {
                Ok(()) => return Ok(staged),
                Err(e) if attempt + 1 < WRITE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "crop stage write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Shard-relative path for an event id, e.g. id 1234 -> `001/1234.jpg`.
    pub fn shard_rel_path(id: i64) -> String {
        format!("{:03}/{}.jpg", id / 1000, id)
    }

    /// Move a staged file to its final sharded location. Runs on the
    /// database thread inside the append transaction, so it is synchronous.
    /// Returns the crop reference stored with the event.
    pub fn install_sync(&self, staged: &Path, id: i64) -> io::Result<String> {
        let rel = Self::shard_rel_path(id);
        let dest = self.crops_dir().join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(staged, &dest)?;
        Ok(rel)
    }

    /// Absolute path for a stored crop reference.
    pub fn crop_path(&self, crop_ref: &str) -> PathBuf {
        self.crops_dir().join(crop_ref)
    }

    /// Remove a staged file that will not be installed.
    pub fn discard(staged: &Path) {
        if let Err(e) = std::fs::remove_file(staged) {
            tracing::debug!(path = %staged.display(), error = %e, "failed to remove staged crop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> CropStore {
        let root = std::env::temp_dir().join(format!("mirador-crops-{}", Uuid::new_v4()));
        let store = CropStore::new(root);
        store.ensure_dirs().unwrap();
        store
    }

    fn gray_crop() -> CropCandidate {
        CropCandidate {
            pixels: vec![128u8; 16 * 16],
            width: 16,
            height: 16,
            channels: 1,
            quality: 0.9,
        }
    }

    #[test]
    fn shard_paths() {
        assert_eq!(CropStore::shard_rel_path(7), "000/7.jpg");
        assert_eq!(CropStore::shard_rel_path(999), "000/999.jpg");
        assert_eq!(CropStore::shard_rel_path(1000), "001/1000.jpg");
        assert_eq!(CropStore::shard_rel_path(123_456), "123/123456.jpg");
    }

    #[test]
    fn encode_gray_jpeg() {
        let jpeg = CropStore::encode_jpeg(&gray_crop()).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn encode_rejects_odd_channel_count() {
        let mut crop = gray_crop();
        crop.channels = 4;
        assert!(matches!(CropStore::encode_jpeg(&crop), Err(CropError::Channels(4))));
    }

    #[tokio::test]
    async fn stage_then_install() {
        let store = temp_store();
        let jpeg = CropStore::encode_jpeg(&gray_crop()).unwrap();

        let staged = store.stage(jpeg).await.unwrap();
        assert!(staged.exists());

        let rel = store.install_sync(&staged, 1234).unwrap();
        assert_eq!(rel, "001/1234.jpg");
        assert!(!staged.exists());
        assert!(store.crop_path(&rel).exists());
    }

    #[tokio::test]
    async fn discard_removes_staged_file() {
        let store = temp_store();
        let staged = store.stage(vec![1, 2, 3]).await.unwrap();
        CropStore::discard(&staged);
        assert!(!staged.exists());
    }
}
