use thiserror::Error;

use pictor_model::ExtensionId;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unreadable or unsupported archive: {0}")]
    BadArchive(String),

    #[error("manifest is not valid JSON: {0}")]
    MalformedManifest(String),

    #[error("manifest invariant violated: {0}")]
    ManifestInvariantViolated(String),

    #[error("archive manifest declares id '{found}', expected '{expected}'")]
    IdMismatch {
        expected: ExtensionId,
        found: ExtensionId,
    },

    #[error("extension already installed: {0}")]
    AlreadyInstalled(ExtensionId),

    #[error("extension not installed: {0}")]
    NotInstalled(ExtensionId),

    #[error("extension is paused: {0}")]
    Paused(ExtensionId),

    #[error("no installed extension provides capability {0}")]
    NoProvider(String),

    #[error("extension {0} did not connect in time")]
    NotConnected(ExtensionId),

    #[error("runtime preparation failed for {extension_id}: {reason}")]
    RuntimePrepFailed {
        extension_id: ExtensionId,
        reason: String,
    },

    #[error("failed to start child process for {extension_id}: {reason}")]
    ChildStartFailed {
        extension_id: ExtensionId,
        reason: String,
    },

    #[error("limiter stopped before the task was released")]
    LimiterStopped,

    #[error("intent was cancelled")]
    IntentCancelled,

    #[error("intent failed: {0}")]
    IntentError(String),

    #[error("extension {0} disconnected with calls pending")]
    ExtensionGone(ExtensionId),

    #[error("caller is not authorised for extension {0}")]
    Forbidden(ExtensionId),

    #[error("extension {extension_id} declares no command '{command_id}'")]
    UnknownCommand {
        extension_id: ExtensionId,
        command_id: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HostError {
    /// Validation-class errors surface as 400-class responses and are never
    /// logged above `warn`.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            HostError::BadArchive(_)
                | HostError::MalformedManifest(_)
                | HostError::ManifestInvariantViolated(_)
                | HostError::IdMismatch { .. }
                | HostError::AlreadyInstalled(_)
                | HostError::NotInstalled(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
