//! In-memory adapters for the persistence ports.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use pictor_model::{ExtensionId, ImageId};

use crate::error::Result;

use super::{
    AttachmentStore, ComputeResultStore, ImageCatalog, SettingsStore,
    VectorStore,
};

/// Catalogue backed by a plain set of ids.
#[derive(Debug, Default)]
pub struct MemoryImageCatalog {
    images: RwLock<HashSet<ImageId>>,
}

impl MemoryImageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image_id: ImageId) {
        self.images.write().insert(image_id);
    }

    pub fn remove(&self, image_id: &ImageId) {
        self.images.write().remove(image_id);
    }
}

#[async_trait]
impl ImageCatalog for MemoryImageCatalog {
    async fn list_image_ids(&self) -> Result<Vec<ImageId>> {
        let mut ids: Vec<ImageId> =
            self.images.read().iter().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, image_id: &ImageId) -> Result<bool> {
        Ok(self.images.read().contains(image_id))
    }
}

/// Compute results held in a nested map.
#[derive(Debug, Default)]
pub struct MemoryComputeResultStore {
    rows: RwLock<HashMap<ExtensionId, HashMap<ImageId, Value>>>,
}

impl MemoryComputeResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
    ) -> bool {
        self.rows
            .read()
            .get(extension_id)
            .is_some_and(|rows| rows.contains_key(image_id))
    }
}

#[async_trait]
impl ComputeResultStore for MemoryComputeResultStore {
    async fn image_ids(
        &self,
        extension_id: &ExtensionId,
    ) -> Result<Vec<ImageId>> {
        let mut ids: Vec<ImageId> = self
            .rows
            .read()
            .get(extension_id)
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn record(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        payload: Value,
    ) -> Result<()> {
        self.rows
            .write()
            .entry(extension_id.clone())
            .or_default()
            .insert(*image_id, payload);
        Ok(())
    }

    async fn remove(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
    ) -> Result<()> {
        if let Some(rows) = self.rows.write().get_mut(extension_id) {
            rows.remove(image_id);
        }
        Ok(())
    }

    async fn remove_all(&self, extension_id: &ExtensionId) -> Result<u64> {
        Ok(self
            .rows
            .write()
            .remove(extension_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }
}

/// Settings blobs held per extension.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<ExtensionId, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, extension_id: &ExtensionId) -> Result<Option<Value>> {
        Ok(self.values.read().get(extension_id).cloned())
    }

    async fn put(
        &self,
        extension_id: &ExtensionId,
        value: Value,
    ) -> Result<()> {
        self.values.write().insert(extension_id.clone(), value);
        Ok(())
    }

    async fn remove(&self, extension_id: &ExtensionId) -> Result<()> {
        self.values.write().remove(extension_id);
        Ok(())
    }
}

/// Attachment paths held per extension.
#[derive(Debug, Default)]
pub struct MemoryAttachmentStore {
    rows: RwLock<HashMap<ExtensionId, Vec<(ImageId, String)>>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn add(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        path: &str,
    ) -> Result<()> {
        self.rows
            .write()
            .entry(extension_id.clone())
            .or_default()
            .push((*image_id, path.to_string()));
        Ok(())
    }

    async fn remove_all(&self, extension_id: &ExtensionId) -> Result<u64> {
        Ok(self
            .rows
            .write()
            .remove(extension_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }
}

/// Vector collections held as maps of embeddings.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<ExtensionId, HashMap<ImageId, Vec<f32>>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_collection(&self, extension_id: &ExtensionId) -> bool {
        self.collections.read().contains_key(extension_id)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(
        &self,
        extension_id: &ExtensionId,
    ) -> Result<()> {
        self.collections
            .write()
            .entry(extension_id.clone())
            .or_default();
        Ok(())
    }

    async fn image_ids(
        &self,
        extension_id: &ExtensionId,
    ) -> Result<Vec<ImageId>> {
        let mut ids: Vec<ImageId> = self
            .collections
            .read()
            .get(extension_id)
            .map(|collection| collection.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn upsert(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        embedding: Vec<f32>,
    ) -> Result<()> {
        self.collections
            .write()
            .entry(extension_id.clone())
            .or_default()
            .insert(*image_id, embedding);
        Ok(())
    }

    async fn remove(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
    ) -> Result<()> {
        if let Some(collection) =
            self.collections.write().get_mut(extension_id)
        {
            collection.remove(image_id);
        }
        Ok(())
    }

    async fn drop_collection(
        &self,
        extension_id: &ExtensionId,
    ) -> Result<()> {
        self.collections.write().remove(extension_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(id: &str) -> ExtensionId {
        ExtensionId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn compute_store_round_trip_and_bulk_removal() {
        let store = MemoryComputeResultStore::new();
        let id = ext("mem");
        let image = ImageId::new();
        store
            .record(&id, &image, serde_json::json!({ "tag": "cat" }))
            .await
            .unwrap();
        assert_eq!(store.image_ids(&id).await.unwrap(), vec![image]);
        assert_eq!(store.remove_all(&id).await.unwrap(), 1);
        assert!(store.image_ids(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vector_store_collections_are_per_extension() {
        let store = MemoryVectorStore::new();
        let a = ext("vec-a");
        let b = ext("vec-b");
        store.ensure_collection(&a).await.unwrap();
        let image = ImageId::new();
        store.upsert(&a, &image, vec![0.5, 0.5]).await.unwrap();
        assert!(store.image_ids(&b).await.unwrap().is_empty());
        store.drop_collection(&a).await.unwrap();
        assert!(!store.has_collection(&a));
    }
}
