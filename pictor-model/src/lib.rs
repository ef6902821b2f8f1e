//! Core data model definitions shared across Pictor crates.
#![allow(missing_docs)]

pub mod error;
pub mod events;
pub mod ids;
pub mod manifest;
pub mod protocol;
pub mod status;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use events::{EventAction, EventEntity, EventMessage, Topic};
pub use ids::{ApiKey, ContextId, ExtensionId, ImageId};
pub use manifest::{
    Capability, CommandBinding, CommandEntity, CommandSpec, EventName,
    ExtensionManifest, InstructionGroup, RuntimeDescriptor, RuntimeKind,
    SchemaDocument, SchemaDraft, ThrottlingPolicy, UiAnchor, UiSurface,
};
pub use protocol::{
    AcknowledgmentBody, ConnectionBody, Envelope, FrameBody, IntentBody,
    IntentReply, LogLevel, LogNotification, NotificationBody,
};
pub use status::{
    ExtendedManifest, ExtensionStatus, ProcessSignal, ProcessSignalKind,
    RegistryStatus,
};
