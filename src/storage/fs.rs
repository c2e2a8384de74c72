use super::{Backend, ByteStream, DirEntry, ObjectMetadata};
use crate::error::StorageError;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;

/// Local directory backend. Stateless apart from its root.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // Keys are normalised before they reach a backend, so a plain join
    // cannot leave the root.
    fn path_for(&self, key: &str) -> PathBuf {
        if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        }
    }
}

#[async_trait]
impl Backend for FsBackend {
    async fn stat(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        let metadata = tokio::fs::metadata(self.path_for(key))
            .await
            .map_err(|e| StorageError::from_io(&e, key))?;

        if metadata.is_dir() {
            let mut dir = ObjectMetadata::directory();
            dir.last_modified = metadata.modified().ok();
            return Ok(dir);
        }

        Ok(ObjectMetadata::file(key, metadata.len(), metadata.modified().ok()))
    }

    async fn read(&self, key: &str) -> Result<ByteStream, StorageError> {
        let file = tokio::fs::File::open(self.path_for(key))
            .await
            .map_err(|e| StorageError::from_io(&e, key))?;

        let key = key.to_string();
        let stream = ReaderStream::new(file).map(move |chunk| chunk.map_err(|e| StorageError::from_io(&e, &key)));
        Ok(stream.boxed())
    }

    async fn list(&self, key: &str) -> Result<Vec<DirEntry>, StorageError> {
        let mut entries = tokio::fs::read_dir(self.path_for(key))
            .await
            .map_err(|e| StorageError::from_io(&e, key))?;

        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StorageError::from_io(&e, key))? {
            // Skip entries whose metadata cannot be read
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let is_dir = metadata.is_dir();
            listing.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
                size: if is_dir { None } else { Some(metadata.len()) },
                last_modified: metadata.modified().ok(),
            });
        }

        listing.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(listing)
    }
}
