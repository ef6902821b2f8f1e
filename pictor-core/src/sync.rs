//! Synchronisation engine.
//!
//! Reconciles persisted per-extension state against the image catalogue:
//! images the extension has not processed yet get a compute event enqueued
//! through the throttling scheduler, rows referencing images that no longer
//! exist are deleted. Features and tags live in relational stores, image
//! embeddings in the vector store. The sweep is idempotent; extensions are
//! expected to be idempotent per image id, so racing the steady-state event
//! stream is harmless.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use pictor_model::manifest::{Capability, ExtensionManifest};
use pictor_model::{EventMessage, ExtensionId, ImageId};

use crate::error::{HostError, Result};
use crate::persistence::{ComputeResultStore, ImageCatalog, VectorStore};
use crate::router::ConnectionRouter;
use crate::throttle::ThrottleScheduler;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub dispatched: usize,
    pub orphans_removed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.dispatched += other.dispatched;
        self.orphans_removed += other.orphans_removed;
    }
}

/// Diffs per-extension state against the catalogue and replays missing work.
pub struct SyncEngine {
    catalog: Arc<dyn ImageCatalog>,
    features: Arc<dyn ComputeResultStore>,
    tags: Arc<dyn ComputeResultStore>,
    vectors: Arc<dyn VectorStore>,
    router: Arc<ConnectionRouter>,
    throttle: ThrottleScheduler,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        catalog: Arc<dyn ImageCatalog>,
        features: Arc<dyn ComputeResultStore>,
        tags: Arc<dyn ComputeResultStore>,
        vectors: Arc<dyn VectorStore>,
        router: Arc<ConnectionRouter>,
        throttle: ThrottleScheduler,
    ) -> Self {
        Self {
            catalog,
            features,
            tags,
            vectors,
            router,
            throttle,
        }
    }

    /// Full per-extension sweep across every image capability it declares.
    pub async fn sweep(
        &self,
        manifest: &ExtensionManifest,
    ) -> Result<SweepReport> {
        let catalogue: BTreeSet<ImageId> =
            self.catalog.list_image_ids().await?.into_iter().collect();
        let mut report = SweepReport::default();

        for capability in manifest.capabilities() {
            if !manifest.provides(capability) {
                continue;
            }
            let outcome = match capability {
                Capability::ImageFeatures => {
                    self.sweep_relational(
                        &manifest.id,
                        capability,
                        self.features.as_ref(),
                        &catalogue,
                    )
                    .await?
                }
                Capability::ImageTags => {
                    self.sweep_relational(
                        &manifest.id,
                        capability,
                        self.tags.as_ref(),
                        &catalogue,
                    )
                    .await?
                }
                Capability::ImageEmbeddings => {
                    self.sweep_vectors(&manifest.id, &catalogue).await?
                }
                // Text embeddings are demand-driven, nothing to reconcile.
                Capability::TextEmbeddings => continue,
            };
            report.merge(outcome);
        }

        info!(
            extension = %manifest.id,
            dispatched = report.dispatched,
            orphans = report.orphans_removed,
            "sweep finished"
        );
        Ok(report)
    }

    /// Demand sweep for a single image: emit every compute event the
    /// extension declares, for that image only.
    pub async fn sweep_image(
        &self,
        manifest: &ExtensionManifest,
        image_id: &ImageId,
    ) -> Result<usize> {
        let mut dispatched = 0;
        for capability in manifest.capabilities() {
            if capability == Capability::TextEmbeddings
                || !manifest.provides(capability)
            {
                continue;
            }
            if self
                .dispatch_compute(&manifest.id, capability, image_id)
                .await?
            {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    async fn sweep_relational(
        &self,
        extension_id: &ExtensionId,
        capability: Capability,
        store: &dyn ComputeResultStore,
        catalogue: &BTreeSet<ImageId>,
    ) -> Result<SweepReport> {
        let have: BTreeSet<ImageId> =
            store.image_ids(extension_id).await?.into_iter().collect();
        let mut report = SweepReport::default();

        for image_id in catalogue.difference(&have) {
            if self
                .dispatch_compute(extension_id, capability, image_id)
                .await?
            {
                report.dispatched += 1;
            }
        }
        for orphan in have.difference(catalogue) {
            store.remove(extension_id, orphan).await?;
            report.orphans_removed += 1;
        }
        Ok(report)
    }

    async fn sweep_vectors(
        &self,
        extension_id: &ExtensionId,
        catalogue: &BTreeSet<ImageId>,
    ) -> Result<SweepReport> {
        let have: BTreeSet<ImageId> = self
            .vectors
            .image_ids(extension_id)
            .await?
            .into_iter()
            .collect();
        let mut report = SweepReport::default();

        for image_id in catalogue.difference(&have) {
            if self
                .dispatch_compute(
                    extension_id,
                    Capability::ImageEmbeddings,
                    image_id,
                )
                .await?
            {
                report.dispatched += 1;
            }
        }
        for orphan in have.difference(catalogue) {
            self.vectors.remove(extension_id, orphan).await?;
            report.orphans_removed += 1;
        }
        Ok(report)
    }

    /// Dispatch one compute event through the limiter. A drained limiter is
    /// the intended consequence of stopping the extension, so it ends the
    /// item quietly rather than failing the sweep.
    async fn dispatch_compute(
        &self,
        extension_id: &ExtensionId,
        capability: Capability,
        image_id: &ImageId,
    ) -> Result<bool> {
        let event = capability.compute_event();
        let message = EventMessage::new(event, json!({ "id": image_id }));
        let outcome = self
            .throttle
            .run(Some(extension_id), event, async {
                self.router.send_event(extension_id, message).await
            })
            .await;
        match outcome {
            Ok(()) => Ok(true),
            Err(HostError::LimiterStopped) => {
                debug!(
                    extension = %extension_id,
                    image = %image_id,
                    "limiter drained mid-sweep"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
