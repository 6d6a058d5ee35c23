//! Blob Storage Abstraction
//!
//! Abstract interface over the blob layout in the pipeline contract
//! (`incoming/`, `original/`, `preprocessed/`, `processed/`, `failed/`).
//! Implementations target Azure Blob Storage in production; an in-memory
//! fake backs handler and worker tests.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

/// Error type for blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Abstract blob storage for image binaries.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch binary content at `path`.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, BlobStoreError>;

    /// Write binary content to `path`, overwriting any existing blob there.
    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), BlobStoreError>;

    /// Copy then delete the source. Safe to repeat after a crash: if the
    /// destination already exists from a prior attempt, the put is a no-op
    /// overwrite and the delete of a missing source is tolerated.
    async fn move_blob(&self, from: &str, to: &str) -> Result<(), BlobStoreError> {
        match self.fetch(from).await {
            Ok(content) => {
                self.put(to, content).await?;
                self.delete(from).await
            }
            Err(BlobStoreError::NotFound(_)) if self.exists(to).await? => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the blob at `path`. Deleting an already-absent blob is not an
    /// error, so retries of a move are safe.
    async fn delete(&self, path: &str) -> Result<(), BlobStoreError>;

    async fn exists(&self, path: &str) -> Result<bool, BlobStoreError>;
}

/// Azure Blob Storage implementation, built from either a connection
/// string or an account URL (the two alternatives in `PipelineConfig`).
pub struct AzureBlobStore {
    store: Box<dyn ObjectStore>,
    container: String,
}

impl AzureBlobStore {
    pub fn from_connection_string(connection_string: &str, container: &str) -> Result<Self, BlobStoreError> {
        let store = MicrosoftAzureBuilder::new()
            .with_container_name(container)
            .with_config(object_store::azure::AzureConfigKey::ConnectionString, connection_string)
            .build()
            .map_err(|e| BlobStoreError::Storage(e.to_string()))?;
        Ok(Self {
            store: Box::new(store),
            container: container.to_string(),
        })
    }

    /// Build from an account URL, relying on the Azure SDK's default
    /// credential chain (managed identity, env vars, or CLI login) rather
    /// than an embedded key.
    pub fn from_account_url(account_url: &str, container: &str) -> Result<Self, BlobStoreError> {
        let store = MicrosoftAzureBuilder::new()
            .with_container_name(container)
            .with_config(object_store::azure::AzureConfigKey::Endpoint, account_url)
            .build()
            .map_err(|e| BlobStoreError::Storage(e.to_string()))?;
        Ok(Self {
            store: Box::new(store),
            container: container.to_string(),
        })
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, BlobStoreError> {
        let object_path = ObjectPath::parse(path)
            .map_err(|e| BlobStoreError::InvalidPath(e.to_string()))?;
        match self.store.get(&object_path).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| BlobStoreError::Storage(e.to_string()))?;
                Ok(bytes.to_vec())
            }
            Err(object_store::Error::NotFound { .. }) => {
                Err(BlobStoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(BlobStoreError::Storage(e.to_string())),
        }
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), BlobStoreError> {
        let object_path = ObjectPath::parse(path)
            .map_err(|e| BlobStoreError::InvalidPath(e.to_string()))?;
        self.store
            .put(&object_path, Bytes::from(content).into())
            .await
            .map_err(|e| BlobStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BlobStoreError> {
        let object_path = ObjectPath::parse(path)
            .map_err(|e| BlobStoreError::InvalidPath(e.to_string()))?;
        match self.store.delete(&object_path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(BlobStoreError::Storage(e.to_string())),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobStoreError> {
        let object_path = ObjectPath::parse(path)
            .map_err(|e| BlobStoreError::InvalidPath(e.to_string()))?;
        match self.store.head(&object_path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(BlobStoreError::Storage(e.to_string())),
        }
    }
}

impl AzureBlobStore {
    pub fn container(&self) -> &str {
        &self.container
    }
}

/// In-memory blob store used by handler and worker tests.
#[cfg(any(test, feature = "testing"))]
pub struct InMemoryBlobStore {
    blobs: std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>>,
}

#[cfg(any(test, feature = "testing"))]
impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: std::sync::Arc::new(tokio::sync::RwLock::new(std::collections::HashMap::new())),
        }
    }

    pub async fn seed(&self, path: &str, content: Vec<u8>) {
        self.blobs.write().await.insert(path.to_string(), content);
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), BlobStoreError> {
        self.blobs.write().await.insert(path.to_string(), content);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BlobStoreError> {
        self.blobs.write().await.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobStoreError> {
        Ok(self.blobs.read().await.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let store = InMemoryBlobStore::new();
        store.put("incoming/b1/p.jpg", b"hello".to_vec()).await.unwrap();
        assert!(store.exists("incoming/b1/p.jpg").await.unwrap());
        let content = store.fetch("incoming/b1/p.jpg").await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn move_blob_archives_and_removes_source() {
        let store = InMemoryBlobStore::new();
        store.put("incoming/b1/p.jpg", b"hello".to_vec()).await.unwrap();
        store.move_blob("incoming/b1/p.jpg", "original/b1/p.jpg").await.unwrap();
        assert!(!store.exists("incoming/b1/p.jpg").await.unwrap());
        assert!(store.exists("original/b1/p.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn move_blob_is_idempotent_after_crash() {
        // Simulate a crash after the first move already completed: the
        // source is gone but the destination exists from the prior attempt.
        let store = InMemoryBlobStore::new();
        store.put("original/b1/p.jpg", b"hello".to_vec()).await.unwrap();
        store.move_blob("incoming/b1/p.jpg", "original/b1/p.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn fetch_missing_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.fetch("nope").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_missing_is_not_an_error() {
        let store = InMemoryBlobStore::new();
        store.delete("nope").await.unwrap();
    }
}
