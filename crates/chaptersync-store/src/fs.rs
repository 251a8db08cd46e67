use std::io;
use std::path::{Component, Path, PathBuf};

use chaptersync_core::{AssetStore, StoreError};
use futures_util::future::BoxFuture;

/// [`AssetStore`] writing page images under a root directory.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative asset path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let clean = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("asset path must be relative and stay under the root: {path}"),
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl AssetStore for FsAssetStore {
    fn write_file<'a>(
        &'a self,
        path: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, bytes).await?;
            tracing::debug!(path = %target.display(), bytes = bytes.len(), "asset written");
            Ok(path.to_string())
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            // Drop the chapter directory once its last page is gone.
            if let Some(parent) = target.parent()
                && parent != self.root
            {
                let _ = tokio::fs::remove_dir(parent).await;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_nested_paths_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAssetStore::new(dir.path());

        let stored = store.write_file("w1/7/001.jpg", &[1, 2, 3]).await.unwrap();
        assert_eq!(stored, "w1/7/001.jpg");
        assert_eq!(std::fs::read(dir.path().join("w1/7/001.jpg")).unwrap(), vec![1, 2, 3]);

        store.delete("w1/7/001.jpg").await.unwrap();
        assert!(!dir.path().join("w1/7").exists());
        // Deleting twice is fine.
        store.delete("w1/7/001.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_paths_outside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAssetStore::new(dir.path());
        for bad in ["../escape.jpg", "/etc/passwd", "", "w1/../../x.jpg"] {
            assert!(
                matches!(store.write_file(bad, b"x").await, Err(StoreError::Io(_))),
                "{bad} accepted"
            );
        }
    }
}
