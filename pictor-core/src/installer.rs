//! Install, update, and uninstall pipelines at the filesystem level.
//!
//! The installer owns everything between an uploaded archive and a ready
//! extension directory: staging checks, manifest semantics, extraction with
//! prefix stripping, runtime provisioning with fresh-install rollback, the
//! vector collection, and state-store cleanup on uninstall. Process
//! lifecycle (stop before update, start after install) is driven by the
//! host facade so this type stays free of supervisor wiring.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::fs;
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use pictor_model::events::HostNotification;
use pictor_model::manifest::{
    Capability, ExtensionManifest, MANIFEST_FILE_NAME,
};
use pictor_model::{
    EventAction, EventEntity, ExtendedManifest, ExtensionId, Topic,
};

use crate::archive::{self, ManifestArchive};
use crate::error::{HostError, Result};
use crate::manifest_rules::validate_manifest;
use crate::notifier::Notifier;
use crate::persistence::{
    AttachmentStore, ComputeResultStore, SettingsStore, VectorStore,
};
use crate::provision::RuntimeProvisioner;
use crate::registry::ExtensionRegistry;

/// Validated archive ready to be materialised.
#[derive(Debug)]
pub struct StagedInstall {
    pub archive: ManifestArchive,
    /// True when this replaces an existing install.
    pub update: bool,
}

impl StagedInstall {
    pub fn manifest(&self) -> &ExtensionManifest {
        &self.archive.manifest
    }
}

pub struct Installer {
    registry: ExtensionRegistry,
    provisioner: Arc<dyn RuntimeProvisioner>,
    features: Arc<dyn ComputeResultStore>,
    tags: Arc<dyn ComputeResultStore>,
    settings: Arc<dyn SettingsStore>,
    attachments: Arc<dyn AttachmentStore>,
    vectors: Arc<dyn VectorStore>,
    notifier: Arc<Notifier>,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("registry", &self.registry)
            .finish()
    }
}

impl Installer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ExtensionRegistry,
        provisioner: Arc<dyn RuntimeProvisioner>,
        features: Arc<dyn ComputeResultStore>,
        tags: Arc<dyn ComputeResultStore>,
        settings: Arc<dyn SettingsStore>,
        attachments: Arc<dyn AttachmentStore>,
        vectors: Arc<dyn VectorStore>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            registry,
            provisioner,
            features,
            tags,
            settings,
            attachments,
            vectors,
            notifier,
        }
    }

    /// Sniff and validate an uploaded archive without touching the tree.
    ///
    /// `maybe_existing` carries the id the caller believes it is updating;
    /// `None` means fresh install. Both directions of the id check apply.
    pub async fn stage(
        &self,
        maybe_existing: Option<&ExtensionId>,
        bytes: Vec<u8>,
    ) -> Result<StagedInstall> {
        let archive =
            spawn_blocking(move || archive::extract_manifest(bytes))
                .await
                .map_err(|err| HostError::Internal(err.to_string()))??;

        let manifest_id = archive.manifest.id.clone();
        if let Some(expected) = maybe_existing {
            if *expected != manifest_id {
                return Err(HostError::IdMismatch {
                    expected: expected.clone(),
                    found: manifest_id,
                });
            }
        }

        let exists = self.registry.exists(&manifest_id).await;
        match (exists, maybe_existing) {
            (true, None) => {
                return Err(HostError::AlreadyInstalled(manifest_id));
            }
            (false, Some(_)) => {
                return Err(HostError::NotInstalled(manifest_id));
            }
            _ => {}
        }

        validate_manifest(&archive.manifest)?;

        Ok(StagedInstall {
            archive,
            update: exists,
        })
    }

    /// Materialise a staged archive: extract, provision, ensure the vector
    /// collection, and announce the result.
    pub async fn materialise(
        &self,
        staged: StagedInstall,
    ) -> Result<ExtendedManifest> {
        let manifest = staged.archive.manifest.clone();
        let directory = self.registry.directory(&manifest.id);
        let fresh = !staged.update;

        if fresh && directory.exists() {
            // Stale remnants of a failed earlier install.
            fs::remove_dir_all(&directory).await?;
        }

        let archive = staged.archive;
        let extract_dir = directory.clone();
        spawn_blocking(move || archive.extract_all(&extract_dir))
            .await
            .map_err(|err| HostError::Internal(err.to_string()))??;

        if let Err(err) = self.provision(&manifest, &directory).await {
            if fresh {
                warn!(
                    extension = %manifest.id,
                    error = %err,
                    "runtime prep failed, rolling back fresh install"
                );
                let _ = fs::remove_dir_all(&directory).await;
            } else {
                warn!(
                    extension = %manifest.id,
                    error = %err,
                    "runtime prep failed on update, directory left in place"
                );
            }
            return Err(err);
        }

        if fresh
            && manifest
                .capabilities()
                .contains(&Capability::ImageEmbeddings)
        {
            self.vectors.ensure_collection(&manifest.id).await?;
        }

        let action = if fresh {
            EventAction::Installed
        } else {
            EventAction::Updated
        };
        self.notifier.emit(
            HostNotification::new(
                Topic::new(EventEntity::Extension, action),
                json!({ "id": manifest.id, "version": manifest.version }),
            )
            .for_extension(manifest.id.clone()),
        );
        info!(extension = %manifest.id, update = staged.update, "extension materialised");

        self.registry
            .get(&manifest.id)
            .await?
            .ok_or_else(|| {
                HostError::Internal(format!(
                    "extension {} vanished after extraction",
                    manifest.id
                ))
            })
    }

    /// Validate an unpacked extension directory in place (no extraction).
    /// The directory name is authoritative, exactly as for archives.
    pub async fn validate_directory(
        &self,
        source: &Path,
    ) -> Result<ExtensionManifest> {
        let raw = fs::read(source.join(MANIFEST_FILE_NAME)).await?;
        let manifest: ExtensionManifest = serde_json::from_slice(&raw)
            .map_err(|err| HostError::MalformedManifest(err.to_string()))?;
        let directory_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if directory_name != manifest.id.as_str() {
            return Err(HostError::ManifestInvariantViolated(format!(
                "directory '{directory_name}' disagrees with manifest id \
                 '{}'",
                manifest.id
            )));
        }
        validate_manifest(&manifest)?;
        self.provision(&manifest, source).await?;
        Ok(manifest)
    }

    async fn provision(
        &self,
        manifest: &ExtensionManifest,
        directory: &Path,
    ) -> Result<()> {
        // Idempotent per interpreter family; duplicate descriptors are
        // prepared once.
        let mut prepared = Vec::new();
        for runtime in &manifest.runtimes {
            if prepared.contains(&runtime.environment) {
                continue;
            }
            self.provisioner
                .prepare(&manifest.id, directory, runtime.environment)
                .await?;
            prepared.push(runtime.environment);
        }
        Ok(())
    }

    /// Remove every trace of an extension: state rows, vector collection,
    /// and the directory (or, for unpacked extensions, only the symlink).
    pub async fn uninstall(&self, extension_id: &ExtensionId) -> Result<()> {
        let directory = self.registry.directory(extension_id);
        if !directory.exists() && fs::symlink_metadata(&directory).await.is_err()
        {
            return Err(HostError::NotInstalled(extension_id.clone()));
        }

        let features = self.features.remove_all(extension_id).await?;
        let tags = self.tags.remove_all(extension_id).await?;
        let attachments = self.attachments.remove_all(extension_id).await?;
        self.settings.remove(extension_id).await?;
        self.vectors.drop_collection(extension_id).await?;
        info!(
            extension = %extension_id,
            features,
            tags,
            attachments,
            "cleared extension state"
        );

        let meta = fs::symlink_metadata(&directory).await?;
        if meta.file_type().is_symlink() {
            // Unpacked extension: the link is the only on-disk trace we
            // own. The source tree stays put.
            fs::remove_file(&directory).await?;
        } else {
            fs::remove_dir_all(&directory).await?;
        }

        self.notifier.emit(
            HostNotification::new(
                Topic::new(EventEntity::Extension, EventAction::Uninstalled),
                json!({ "id": extension_id }),
            )
            .for_extension(extension_id.clone()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::persistence::memory::{
        MemoryAttachmentStore, MemoryComputeResultStore, MemorySettingsStore,
        MemoryVectorStore,
    };
    use crate::provision::NoopProvisioner;
    use pictor_model::manifest::RuntimeKind;
    use pictor_model::ImageId;

    fn manifest_json(id: &str, capability: &str, compute_event: &str) -> String {
        serde_json::json!({
            "id": id,
            "version": "0.2.0",
            "name": id,
            "description": "fixture",
            "runtimes": [{ "environment": "python" }],
            "instructions": [{
                "events": [
                    "ProcessStarted",
                    "ImageCreated",
                    "ImageUpdated",
                    compute_event
                ],
                "capabilities": [capability]
            }],
            "settings": { "type": "object" }
        })
        .to_string()
    }

    fn targz(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(
            std::io::Cursor::new(Vec::new()),
            Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let data = contents.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder
            .into_inner()
            .unwrap()
            .finish()
            .unwrap()
            .into_inner()
    }

    struct Fixture {
        installer: Installer,
        vectors: Arc<MemoryVectorStore>,
        tags: Arc<MemoryComputeResultStore>,
        settings: Arc<MemorySettingsStore>,
        root: tempfile::TempDir,
    }

    fn fixture_with(provisioner: Arc<dyn RuntimeProvisioner>) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let registry = ExtensionRegistry::new(root.path());
        let vectors = Arc::new(MemoryVectorStore::new());
        let tags = Arc::new(MemoryComputeResultStore::new());
        let settings = Arc::new(MemorySettingsStore::new());
        let installer = Installer::new(
            registry,
            provisioner,
            Arc::new(MemoryComputeResultStore::new()),
            Arc::clone(&tags) as Arc<dyn ComputeResultStore>,
            Arc::clone(&settings) as Arc<dyn SettingsStore>,
            Arc::new(MemoryAttachmentStore::new()),
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            Arc::new(Notifier::new()),
        );
        Fixture {
            installer,
            vectors,
            tags,
            settings,
            root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoopProvisioner))
    }

    fn tagger_archive(id: &str) -> Vec<u8> {
        targz(&[
            (
                "pkg/manifest.json",
                &manifest_json(id, "ImageTags", "ImageComputeTags"),
            ),
            ("pkg/main.py", "print('hi')"),
        ])
    }

    #[tokio::test]
    async fn install_extracts_with_prefix_stripped() {
        let fx = fixture();
        let staged = fx
            .installer
            .stage(None, tagger_archive("fresh"))
            .await
            .unwrap();
        assert!(!staged.update);
        let extended = fx.installer.materialise(staged).await.unwrap();
        assert_eq!(extended.manifest.id.as_str(), "fresh");
        let dir = fx.root.path().join("fresh");
        assert!(dir.join(MANIFEST_FILE_NAME).is_file());
        assert!(dir.join("main.py").is_file());
        assert!(!dir.join("pkg").exists());
    }

    #[tokio::test]
    async fn double_install_is_already_installed() {
        let fx = fixture();
        let staged =
            fx.installer.stage(None, tagger_archive("dup")).await.unwrap();
        fx.installer.materialise(staged).await.unwrap();
        let err = fx
            .installer
            .stage(None, tagger_archive("dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::AlreadyInstalled(_)));
    }

    #[tokio::test]
    async fn update_requires_matching_id() {
        let fx = fixture();
        let staged =
            fx.installer.stage(None, tagger_archive("one")).await.unwrap();
        fx.installer.materialise(staged).await.unwrap();

        let other = ExtensionId::parse("other").unwrap();
        let err = fx
            .installer
            .stage(Some(&other), tagger_archive("one"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::IdMismatch { .. }));

        let one = ExtensionId::parse("one").unwrap();
        let staged = fx
            .installer
            .stage(Some(&one), tagger_archive("one"))
            .await
            .unwrap();
        assert!(staged.update);
    }

    #[tokio::test]
    async fn update_of_missing_extension_is_not_installed() {
        let fx = fixture();
        let ghost = ExtensionId::parse("ghost").unwrap();
        let err = fx
            .installer
            .stage(Some(&ghost), tagger_archive("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn embeddings_install_ensures_the_vector_collection() {
        let fx = fixture();
        let bytes = targz(&[(
            "manifest.json",
            &manifest_json(
                "embedder",
                "ImageEmbeddings",
                "ImageComputeEmbeddings",
            ),
        )]);
        let staged = fx.installer.stage(None, bytes).await.unwrap();
        fx.installer.materialise(staged).await.unwrap();
        assert!(
            fx.vectors
                .has_collection(&ExtensionId::parse("embedder").unwrap())
        );
    }

    struct FailingProvisioner;

    #[async_trait]
    impl RuntimeProvisioner for FailingProvisioner {
        async fn prepare(
            &self,
            extension_id: &ExtensionId,
            _directory: &Path,
            _runtime: RuntimeKind,
        ) -> Result<()> {
            Err(HostError::RuntimePrepFailed {
                extension_id: extension_id.clone(),
                reason: "no interpreter".into(),
            })
        }
    }

    #[tokio::test]
    async fn failed_prep_rolls_back_a_fresh_install() {
        let fx = fixture_with(Arc::new(FailingProvisioner));
        let staged = fx
            .installer
            .stage(None, tagger_archive("doomed"))
            .await
            .unwrap();
        let err = fx.installer.materialise(staged).await.unwrap_err();
        assert!(matches!(err, HostError::RuntimePrepFailed { .. }));
        assert!(!fx.root.path().join("doomed").exists());
    }

    #[tokio::test]
    async fn uninstall_clears_state_and_directory() {
        let fx = fixture();
        let staged = fx
            .installer
            .stage(None, tagger_archive("leaver"))
            .await
            .unwrap();
        fx.installer.materialise(staged).await.unwrap();

        let id = ExtensionId::parse("leaver").unwrap();
        fx.tags
            .record(&id, &ImageId::new(), serde_json::json!({}))
            .await
            .unwrap();
        fx.settings
            .put(&id, serde_json::json!({ "model": "v2" }))
            .await
            .unwrap();

        fx.installer.uninstall(&id).await.unwrap();
        assert!(!fx.root.path().join("leaver").exists());
        assert!(fx.tags.image_ids(&id).await.unwrap().is_empty());
        assert!(fx.settings.get(&id).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uninstall_of_unpacked_extension_removes_only_the_symlink() {
        let fx = fixture();
        let source = tempfile::tempdir().unwrap();
        let source_dir = source.path().join("devext");
        std::fs::create_dir_all(&source_dir).unwrap();
        let mut file =
            std::fs::File::create(source_dir.join(MANIFEST_FILE_NAME))
                .unwrap();
        file.write_all(
            manifest_json("devext", "ImageTags", "ImageComputeTags")
                .as_bytes(),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            &source_dir,
            fx.root.path().join("devext"),
        )
        .unwrap();

        let id = ExtensionId::parse("devext").unwrap();
        fx.installer.uninstall(&id).await.unwrap();
        assert!(!fx.root.path().join("devext").exists());
        // the source tree survives
        assert!(source_dir.join(MANIFEST_FILE_NAME).is_file());
    }
}
