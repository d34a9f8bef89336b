//! Removal of previously generated maps.

use std::sync::Arc;

use meteomap_core::DeletionRequest;
use meteomap_storage::{ObjectStore, StorageError};

/// Deletes stored maps on request. Deleting an absent key succeeds.
pub struct DeletionHandler {
    store: Arc<dyn ObjectStore>,
}

impl DeletionHandler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Keys are validated by the store before anything is removed.
    pub async fn handle(&self, request: &DeletionRequest) -> Result<(), StorageError> {
        self.store.delete(&request.object_key).await?;
        tracing::info!(key = %request.object_key, "Map deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use meteomap_storage::InMemoryObjectStore;

    use super::*;

    fn request(key: &str) -> DeletionRequest {
        DeletionRequest {
            object_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn deletes_existing_map() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert("gfs/20250101/12/t2m/003.png", vec![1, 2, 3]);
        let handler = DeletionHandler::new(store.clone());

        handler.handle(&request("gfs/20250101/12/t2m/003.png")).await.unwrap();

        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_success() {
        let handler = DeletionHandler::new(Arc::new(InMemoryObjectStore::new()));
        handler.handle(&request("gfs/20250101/12/t2m/999.png")).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_key_is_rejected() {
        let handler = DeletionHandler::new(Arc::new(InMemoryObjectStore::new()));
        assert_matches!(
            handler.handle(&request("")).await,
            Err(StorageError::InvalidKey { .. })
        );
    }
}
