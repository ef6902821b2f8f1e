//! Postgres adapters for the persistence ports.
//!
//! Queries use the runtime API with bound parameters so the crate builds
//! without a live database. Table names are compile-time constants, never
//! caller input.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use pictor_model::{ExtensionId, ImageId};

use crate::error::{HostError, Result};

use super::{
    AttachmentStore, ComputeResultStore, ImageCatalog, SettingsStore,
};

fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> HostError + '_ {
    move |err| HostError::Internal(format!("{context}: {err}"))
}

/// Catalogue view over the `images` table.
#[derive(Clone, Debug)]
pub struct PostgresImageCatalog {
    pool: PgPool,
}

impl PostgresImageCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageCatalog for PostgresImageCatalog {
    async fn list_image_ids(&self) -> Result<Vec<ImageId>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM images ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err("listing images"))?;
        Ok(ids.into_iter().map(ImageId::from).collect())
    }

    async fn exists(&self, image_id: &ImageId) -> Result<bool> {
        let found: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM images WHERE id = $1")
                .bind(image_id.to_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("checking image"))?;
        Ok(found.is_some())
    }
}

/// Compute-result rows keyed by `(image_id, extension_id)`. Features and
/// tags are two instances over their respective tables.
#[derive(Clone, Debug)]
pub struct PostgresComputeResultStore {
    pool: PgPool,
    table: &'static str,
}

impl PostgresComputeResultStore {
    pub fn features(pool: PgPool) -> Self {
        Self {
            pool,
            table: "extension_features",
        }
    }

    pub fn tags(pool: PgPool) -> Self {
        Self {
            pool,
            table: "extension_tags",
        }
    }
}

#[async_trait]
impl ComputeResultStore for PostgresComputeResultStore {
    async fn image_ids(
        &self,
        extension_id: &ExtensionId,
    ) -> Result<Vec<ImageId>> {
        let sql = format!(
            "SELECT image_id FROM {} WHERE extension_id = $1 ORDER BY image_id",
            self.table
        );
        let ids: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(extension_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err(self.table))?;
        Ok(ids.into_iter().map(ImageId::from).collect())
    }

    async fn record(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        payload: Value,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (extension_id, image_id, payload, created_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (extension_id, image_id)
             DO UPDATE SET payload = EXCLUDED.payload",
            self.table
        );
        sqlx::query(&sql)
            .bind(extension_id.as_str())
            .bind(image_id.to_uuid())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(db_err(self.table))?;
        Ok(())
    }

    async fn remove(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE extension_id = $1 AND image_id = $2",
            self.table
        );
        sqlx::query(&sql)
            .bind(extension_id.as_str())
            .bind(image_id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err(self.table))?;
        Ok(())
    }

    async fn remove_all(&self, extension_id: &ExtensionId) -> Result<u64> {
        let sql =
            format!("DELETE FROM {} WHERE extension_id = $1", self.table);
        let result = sqlx::query(&sql)
            .bind(extension_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err(self.table))?;
        Ok(result.rows_affected())
    }
}

/// Settings blobs in `extension_settings`.
#[derive(Clone, Debug)]
pub struct PostgresSettingsStore {
    pool: PgPool,
}

impl PostgresSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PostgresSettingsStore {
    async fn get(&self, extension_id: &ExtensionId) -> Result<Option<Value>> {
        sqlx::query_scalar(
            "SELECT value FROM extension_settings WHERE extension_id = $1",
        )
        .bind(extension_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("reading settings"))
    }

    async fn put(
        &self,
        extension_id: &ExtensionId,
        value: Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO extension_settings (extension_id, value, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (extension_id)
             DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(extension_id.as_str())
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err("writing settings"))?;
        Ok(())
    }

    async fn remove(&self, extension_id: &ExtensionId) -> Result<()> {
        sqlx::query(
            "DELETE FROM extension_settings WHERE extension_id = $1",
        )
        .bind(extension_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("deleting settings"))?;
        Ok(())
    }
}

/// Attachment rows in `extension_attachments`.
#[derive(Clone, Debug)]
pub struct PostgresAttachmentStore {
    pool: PgPool,
}

impl PostgresAttachmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttachmentStore for PostgresAttachmentStore {
    async fn add(
        &self,
        extension_id: &ExtensionId,
        image_id: &ImageId,
        path: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO extension_attachments (extension_id, image_id, path)
             VALUES ($1, $2, $3)",
        )
        .bind(extension_id.as_str())
        .bind(image_id.to_uuid())
        .bind(path)
        .execute(&self.pool)
        .await
        .map_err(db_err("adding attachment"))?;
        Ok(())
    }

    async fn remove_all(&self, extension_id: &ExtensionId) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM extension_attachments WHERE extension_id = $1",
        )
        .bind(extension_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("deleting attachments"))?;
        Ok(result.rows_affected())
    }
}
