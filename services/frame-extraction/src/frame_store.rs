//! Flat-directory persistence of extracted frames.

use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create frame directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write frame {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Writes `{frame_id}.jpg` files into one directory. Existing files with the
/// same name are overwritten.
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
}

impl FrameStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, frame_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", frame_id))
    }

    /// Persist an encoded JPEG, creating the directory on first use.
    pub fn save(&self, frame_id: &str, jpeg: &[u8]) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(frame_id);
        fs::write(&path, jpeg).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), bytes = jpeg.len(), "Frame saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("frames");
        let store = FrameStore::new(&dir);

        let path = store.save("cam_x_frame_0", b"jpeg-bytes").unwrap();

        assert_eq!(path, dir.join("cam_x_frame_0.jpg"));
        assert_eq!(fs::read(&path).unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn test_save_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FrameStore::new(tmp.path());

        store.save("dup", b"first").unwrap();
        let path = store.save("dup", b"second").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"second");
    }

    #[test]
    fn test_save_fails_when_dir_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("frames");
        fs::write(&blocker, b"not a directory").unwrap();

        let store = FrameStore::new(&blocker);
        assert!(store.save("f", b"x").is_err());
    }
}
