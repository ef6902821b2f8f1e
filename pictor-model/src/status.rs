//! Lifecycle status types and supervisor signals.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::ExtensionId;
use crate::manifest::ExtensionManifest;

/// Process-wide lifecycle state of one installed extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionStatus {
    Installed,
    Paused,
    Connecting,
    Connected,
    Error,
    Uninstalling,
}

impl fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// On-disk status derived from the pause sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryStatus {
    Enabled,
    Paused,
}

/// What kind of signal a supervised child delivered upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessSignalKind {
    Started,
    Stopped,
    Error,
    Fatal,
}

/// Signal routed from the process supervisor to the owning service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSignal {
    pub extension_id: ExtensionId,
    #[serde(rename = "type")]
    pub kind: ProcessSignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ProcessSignal {
    pub fn new(extension_id: ExtensionId, kind: ProcessSignalKind) -> Self {
        Self {
            extension_id,
            kind,
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Registry listing entry: the parsed manifest plus where it lives on disk
/// and how it is currently flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedManifest {
    #[serde(flatten)]
    pub manifest: ExtensionManifest,
    pub status: RegistryStatus,
    pub directory: PathBuf,
    /// True when the extension entry is a symbolic link into a live source
    /// tree (unpacked extension under development).
    pub unpacked: bool,
}

impl ExtendedManifest {
    pub fn id(&self) -> &ExtensionId {
        &self.manifest.id
    }

    pub fn is_paused(&self) -> bool {
        self.status == RegistryStatus::Paused
    }
}
