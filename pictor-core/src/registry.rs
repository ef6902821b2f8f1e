//! Installed-extension registry.
//!
//! Enumerates the on-disk tree of installed extensions. The directory name
//! is the authoritative identifier; a manifest whose `id` disagrees is
//! skipped with a warning. Symbolic-link entries are honoured so unpacked
//! extensions under development appear as ordinary installs.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use pictor_model::manifest::{
    Capability, ExtensionManifest, MANIFEST_FILE_NAME,
};
use pictor_model::{ExtendedManifest, ExtensionId, RegistryStatus};

use crate::error::{HostError, Result};

/// Marker file flagging an extension that must not be started.
pub const PAUSE_SENTINEL: &str = ".paused";

/// Filesystem-backed registry over the installed-extensions root.
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    root: PathBuf,
}

impl ExtensionRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolved directory of one extension.
    pub fn directory(&self, id: &ExtensionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn sentinel_path(&self, id: &ExtensionId) -> PathBuf {
        self.directory(id).join(PAUSE_SENTINEL)
    }

    /// Enumerate installed extensions, one directory level deep.
    pub async fn list(
        &self,
        include_paused: bool,
    ) -> Result<Vec<ExtendedManifest>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut extensions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let symlink = entry.file_type().await?.is_symlink();
            let path = entry.path();
            if !fs::metadata(&path)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false)
            {
                continue;
            }
            match self.load_entry(&path, symlink).await {
                Ok(Some(extended)) => {
                    if include_paused || !extended.is_paused() {
                        extensions.push(extended);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        directory = %path.display(),
                        error = %err,
                        "skipping extension with unreadable manifest"
                    );
                }
            }
        }

        extensions.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        Ok(extensions)
    }

    async fn load_entry(
        &self,
        path: &Path,
        unpacked: bool,
    ) -> Result<Option<ExtendedManifest>> {
        let manifest_path = path.join(MANIFEST_FILE_NAME);
        let raw = match fs::read(&manifest_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let manifest: ExtensionManifest = serde_json::from_slice(&raw)
            .map_err(|err| HostError::MalformedManifest(err.to_string()))?;

        let directory_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if directory_name != manifest.id.as_str() {
            warn!(
                directory = %path.display(),
                manifest_id = %manifest.id,
                "directory name disagrees with manifest id, skipping"
            );
            return Ok(None);
        }

        let paused = path.join(PAUSE_SENTINEL).exists();
        Ok(Some(ExtendedManifest {
            manifest,
            status: if paused {
                RegistryStatus::Paused
            } else {
                RegistryStatus::Enabled
            },
            directory: path.to_path_buf(),
            unpacked,
        }))
    }

    pub async fn exists(&self, id: &ExtensionId) -> bool {
        self.directory(id).join(MANIFEST_FILE_NAME).exists()
    }

    /// Load one extension by id.
    pub async fn get(
        &self,
        id: &ExtensionId,
    ) -> Result<Option<ExtendedManifest>> {
        let path = self.directory(id);
        if !path.exists() {
            return Ok(None);
        }
        let symlink = fs::symlink_metadata(&path)
            .await
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        self.load_entry(&path, symlink).await
    }

    pub async fn get_status(&self, id: &ExtensionId) -> Result<RegistryStatus> {
        if !self.exists(id).await {
            return Err(HostError::NotInstalled(id.clone()));
        }
        Ok(if self.sentinel_path(id).exists() {
            RegistryStatus::Paused
        } else {
            RegistryStatus::Enabled
        })
    }

    /// Create or remove the pause sentinel.
    pub async fn pause_or_resume(
        &self,
        id: &ExtensionId,
        pause: bool,
    ) -> Result<()> {
        if !self.exists(id).await {
            return Err(HostError::NotInstalled(id.clone()));
        }
        let sentinel = self.sentinel_path(id);
        if pause {
            fs::write(&sentinel, b"").await?;
        } else {
            match fs::remove_file(&sentinel).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Extensions whose manifest declares `capability` together with a
    /// `ProcessStarted` subscription in the same instruction group.
    pub async fn extensions_with_capability(
        &self,
        capability: Capability,
        include_paused: bool,
    ) -> Result<Vec<ExtendedManifest>> {
        let extensions = self.list(include_paused).await?;
        Ok(extensions
            .into_iter()
            .filter(|extended| extended.manifest.provides(capability))
            .collect())
    }
}
