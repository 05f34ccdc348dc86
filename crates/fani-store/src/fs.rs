//! On-disk content store.

use crate::address::ContentAddress;
use crate::error::{Result, StoreError};
use crate::store::ContentStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the subdirectory holding block files.
const BLOCKS_DIR: &str = "blocks";

/// A content store that keeps one file per blob under `<root>/blocks`.
///
/// Blocks are written to a temporary file and renamed into place, so a
/// block file is either absent or complete. Reads re-hash the file and
/// report corruption as an integrity mismatch; writing the same content
/// again replaces a corrupt file.
#[derive(Debug, Clone)]
pub struct FsStore {
    blocks_dir: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let blocks_dir = root.as_ref().join(BLOCKS_DIR);
        tokio::fs::create_dir_all(&blocks_dir).await.map_err(|e| {
            tracing::error!(path = %blocks_dir.display(), error = %e, "Failed to create block directory");
            StoreError::Io(format!("failed to create {}: {e}", blocks_dir.display()))
        })?;
        tracing::debug!(path = %blocks_dir.display(), "Opened block store");
        Ok(Self { blocks_dir })
    }

    /// Directory holding the block files.
    pub fn blocks_dir(&self) -> &Path {
        &self.blocks_dir
    }

    fn block_path(&self, address: &ContentAddress) -> PathBuf {
        self.blocks_dir.join(address.to_string())
    }
}

#[async_trait]
impl ContentStore for FsStore {
    async fn put(&self, data: Bytes) -> Result<ContentAddress> {
        let address = ContentAddress::of(&data);
        let path = self.block_path(&address);

        match tokio::fs::read(&path).await {
            Ok(existing) if address.verify(&existing).is_ok() => {
                tracing::trace!(address = %address, "Block already stored");
                return Ok(address);
            }
            Ok(_) => {
                tracing::warn!(address = %address, path = %path.display(), "Replacing corrupt block");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Write(format!("{}: {e}", path.display()))),
        }

        let tmp = self
            .blocks_dir
            .join(format!(".{address}.{}.tmp", Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Write(format!("{}: {e}", tmp.display())));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Write(format!("{}: {e}", path.display())));
        }

        tracing::debug!(address = %address, size = data.len(), "Stored block");
        Ok(address)
    }

    async fn get(&self, address: &ContentAddress) -> Result<Bytes> {
        let path = self.block_path(address);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*address));
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = address.verify(&data) {
            tracing::error!(address = %address, path = %path.display(), "Stored block is corrupt");
            return Err(e);
        }
        Ok(Bytes::from(data))
    }

    async fn has(&self, address: &ContentAddress) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.block_path(address)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        let data = Bytes::from_static(b"\0asm\x01\0\0\0");
        let address = store.put(data.clone()).await.unwrap();
        assert_eq!(store.get(&address).await.unwrap(), data);
        assert!(store
            .blocks_dir()
            .join(address.to_string())
            .exists());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let address = {
            let store = FsStore::open(dir.path()).await.unwrap();
            store.put(Bytes::from_static(b"persisted")).await.unwrap()
        };
        let store = FsStore::open(dir.path()).await.unwrap();
        assert!(store.has(&address).await.unwrap());
        assert_eq!(
            store.get(&address).await.unwrap(),
            Bytes::from_static(b"persisted")
        );
    }

    #[tokio::test]
    async fn test_get_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let result = store.get(&ContentAddress::of(b"nope")).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let address = store.put(Bytes::from_static(b"original")).await.unwrap();

        std::fs::write(store.blocks_dir().join(address.to_string()), b"tampered").unwrap();

        let result = store.get(&address).await;
        assert!(matches!(result, Err(StoreError::IntegrityMismatch { .. })));
    }

    #[tokio::test]
    async fn test_put_repairs_corrupt_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let data = Bytes::from_static(b"content");
        let address = store.put(data.clone()).await.unwrap();

        std::fs::write(store.blocks_dir().join(address.to_string()), b"rot").unwrap();
        assert!(store.get(&address).await.is_err());

        assert_eq!(store.put(data.clone()).await.unwrap(), address);
        assert_eq!(store.get(&address).await.unwrap(), data);
    }
}
