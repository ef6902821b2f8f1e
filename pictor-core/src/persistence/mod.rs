//! Persistence ports for per-extension state.
//!
//! The synchronisation engine and installer talk to storage exclusively
//! through these traits. Relational adapters live in [`postgres`]; the
//! in-memory adapters in [`memory`] back tests and single-node setups. The
//! vector backend is an external collaborator, so only its port plus a
//! memory stand-in ship here.

use async_trait::async_trait;
use serde_json::Value;

use pictor_model::{ExtensionId, ImageId};

use crate::error::Result;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

/// Read-side view of the image catalogue.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    async fn list_image_ids(&self) -> Result<Vec<ImageId>>;

    async fn exists(&self, image_id: &ImageId) -> Result<bool>;
}

/// Per-`(image, extension)` compute results; features and tags share this
/// shape and differ only in their backing table.
#[async_trait]
pub trait ComputeResultStore: Send + Sync {
    /// Images this extension has produced a result for.
    async fn image_ids(
        &self,
        extension_id: &ExtensionId,
    ) -> Result<Vec<ImageId>>;

    async fn record(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        payload: Value,
    ) -> Result<()>;

    async fn remove(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
    ) -> Result<()>;

    /// Drop every row for the extension; returns how many went away.
    async fn remove_all(&self, extension_id: &ExtensionId) -> Result<u64>;
}

/// Per-extension settings blob, validated against the manifest schema at the
/// API boundary before it lands here.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, extension_id: &ExtensionId) -> Result<Option<Value>>;

    async fn put(
        &self,
        extension_id: &ExtensionId,
        value: Value,
    ) -> Result<()>;

    async fn remove(&self, extension_id: &ExtensionId) -> Result<()>;
}

/// Files an extension attached to images; only enumeration and bulk removal
/// matter to the host core.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn add(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        path: &str,
    ) -> Result<()>;

    async fn remove_all(&self, extension_id: &ExtensionId) -> Result<u64>;
}

/// Port over the vector database holding per-extension image embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the extension's collection if it does not exist yet.
    async fn ensure_collection(&self, extension_id: &ExtensionId)
    -> Result<()>;

    async fn image_ids(
        &self,
        extension_id: &ExtensionId,
    ) -> Result<Vec<ImageId>>;

    async fn upsert(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        embedding: Vec<f32>,
    ) -> Result<()>;

    async fn remove(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
    ) -> Result<()>;

    async fn drop_collection(&self, extension_id: &ExtensionId) -> Result<()>;
}
