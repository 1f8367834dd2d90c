//! Object storage boundary: finished media goes in, a durable URL comes out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Persist a file and return a durable URL for it.
    async fn put_file(&self, path: &Path) -> Result<String>;
}

/// Local filesystem storage served from the daemon's media directory.
pub struct LocalStorage {
    root: PathBuf,
    public_base: String,
}

impl LocalStorage {
    pub fn new(root: PathBuf, public_base: String) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(LocalStorage { root, public_base })
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put_file(&self, path: &Path) -> Result<String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("source file has no name")?;
        let key = format!("{}-{}", uuid::Uuid::new_v4(), file_name);
        let dest = self.root.join(&key);
        tokio::fs::copy(path, &dest)
            .await
            .with_context(|| format!("storing {:?}", path))?;
        Ok(format!("{}/{}", self.public_base.trim_end_matches('/'), key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_file_copies_and_returns_url() {
        let src_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("clip.mp4");
        tokio::fs::write(&src, b"not really a video").await.unwrap();

        let storage = LocalStorage::new(
            store_dir.path().to_path_buf(),
            "http://127.0.0.1:7801/media".to_string(),
        )
        .unwrap();

        let url = storage.put_file(&src).await.unwrap();
        assert!(url.starts_with("http://127.0.0.1:7801/media/"));
        assert!(url.ends_with("clip.mp4"));

        let stored: Vec<_> = std::fs::read_dir(store_dir.path()).unwrap().collect();
        assert_eq!(stored.len(), 1);
    }
}
