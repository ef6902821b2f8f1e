//! Extension manifest document types.
//!
//! The manifest is the immutable contract an extension ships inside its
//! archive. Parsing is plain serde; semantic validation (capability/event
//! implications, schema well-formedness) lives with the installer so the
//! model crate stays free of policy.

use std::collections::BTreeSet;
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{EventAction, EventEntity, Topic};
use crate::ids::ExtensionId;

/// File name every extension bundle must carry, at any depth.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Closed set of events an extension can subscribe to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EventName {
    ProcessStarted,
    ProcessRunCommand,
    ImageCreated,
    ImageUpdated,
    ImageDeleted,
    ImageComputeFeatures,
    ImageComputeEmbeddings,
    ImageComputeTags,
    ImageRunCommand,
    TextComputeEmbeddings,
}

impl EventName {
    /// The notifier topic this event is published under.
    pub fn topic(self) -> Topic {
        use EventAction::*;
        use EventEntity::*;
        let (entity, action) = match self {
            EventName::ProcessStarted => (Process, Started),
            EventName::ProcessRunCommand => (Process, RunCommand),
            EventName::ImageCreated => (Image, Created),
            EventName::ImageUpdated => (Image, Updated),
            EventName::ImageDeleted => (Image, Deleted),
            EventName::ImageComputeFeatures => (Image, ComputeFeatures),
            EventName::ImageComputeEmbeddings => (Image, ComputeEmbeddings),
            EventName::ImageComputeTags => (Image, ComputeTags),
            EventName::ImageRunCommand => (Image, RunCommand),
            EventName::TextComputeEmbeddings => (Text, ComputeEmbeddings),
        };
        Topic::new(entity, action)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Declared ability of an extension to produce a class of outputs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Capability {
    ImageFeatures,
    ImageEmbeddings,
    ImageTags,
    TextEmbeddings,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::ImageFeatures,
        Capability::ImageEmbeddings,
        Capability::ImageTags,
        Capability::TextEmbeddings,
    ];

    /// Events an instruction group must subscribe to before it may declare
    /// this capability. `ProcessStarted` is required for every capability on
    /// top of the listed ones.
    pub fn required_events(self) -> &'static [EventName] {
        match self {
            Capability::ImageFeatures => &[
                EventName::ImageCreated,
                EventName::ImageUpdated,
                EventName::ImageComputeFeatures,
            ],
            Capability::ImageEmbeddings => &[
                EventName::ImageCreated,
                EventName::ImageUpdated,
                EventName::ImageComputeEmbeddings,
            ],
            Capability::ImageTags => &[
                EventName::ImageCreated,
                EventName::ImageUpdated,
                EventName::ImageComputeTags,
            ],
            Capability::TextEmbeddings => &[EventName::TextComputeEmbeddings],
        }
    }

    /// The compute event driving this capability.
    pub fn compute_event(self) -> EventName {
        match self {
            Capability::ImageFeatures => EventName::ImageComputeFeatures,
            Capability::ImageEmbeddings => EventName::ImageComputeEmbeddings,
            Capability::ImageTags => EventName::ImageComputeTags,
            Capability::TextEmbeddings => EventName::TextComputeEmbeddings,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Interpreter family an extension runs under.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Node,
    Python,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Node => f.write_str("node"),
            RuntimeKind::Python => f.write_str("python"),
        }
    }
}

/// One runtime environment descriptor from the manifest's `runtimes` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub environment: RuntimeKind,
}

/// Entity a command is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandEntity {
    Process,
    Image,
    Images,
}

/// Where a command shows up and which tagged images it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBinding {
    pub entity: CommandEntity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_tags: Option<Vec<String>>,
}

/// An ad-hoc command an extension exposes to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub id: String,
    pub on: CommandBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<SchemaDocument>,
}

/// Rate/concurrency limits an extension requests for a set of its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlingPolicy {
    pub events: BTreeSet<EventName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_in_milliseconds: Option<u64>,
}

impl ThrottlingPolicy {
    /// A policy must bound at least one dimension to mean anything.
    pub fn has_bound(&self) -> bool {
        self.maximum_count.is_some()
            || self.duration_in_milliseconds.is_some()
    }
}

/// A manifest record binding events to capabilities, commands, and policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionGroup {
    pub events: BTreeSet<EventName>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub throttling_policies: Vec<ThrottlingPolicy>,
}

/// JSON Schema draft dialect a schema document is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaDraft {
    Draft7,
    Draft2020_12,
}

/// A user-supplied JSON schema, kept opaque to the core and tagged with the
/// dialect sniffed from its `$schema` key (draft-07 when absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct SchemaDocument {
    pub draft: SchemaDraft,
    pub root: Value,
}

impl From<Value> for SchemaDocument {
    fn from(root: Value) -> Self {
        let draft = root
            .get("$schema")
            .and_then(Value::as_str)
            .map(|uri| {
                if uri.contains("2020-12") {
                    SchemaDraft::Draft2020_12
                } else {
                    SchemaDraft::Draft7
                }
            })
            .unwrap_or(SchemaDraft::Draft7);
        Self { draft, root }
    }
}

impl From<SchemaDocument> for Value {
    fn from(doc: SchemaDocument) -> Self {
        doc.root
    }
}

/// Anchor point for an extension-provided UI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UiAnchor {
    Modal,
    Sidebar,
    ImageDetail,
}

/// A UI surface the extension wants embedded in the management frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiSurface {
    pub anchor: UiAnchor,
    pub url: String,
}

/// The immutable per-extension manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub id: ExtensionId,
    pub version: Version,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub runtimes: Vec<RuntimeDescriptor>,
    pub instructions: Vec<InstructionGroup>,
    pub settings: SchemaDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Vec<UiSurface>>,
}

impl ExtensionManifest {
    /// All events declared across instruction groups.
    pub fn events(&self) -> BTreeSet<EventName> {
        self.instructions
            .iter()
            .flat_map(|group| group.events.iter().copied())
            .collect()
    }

    /// All capabilities declared across instruction groups.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.instructions
            .iter()
            .flat_map(|group| group.capabilities.iter().copied())
            .collect()
    }

    /// Whether some instruction group declares `capability` alongside a
    /// `ProcessStarted` subscription.
    pub fn provides(&self, capability: Capability) -> bool {
        self.instructions.iter().any(|group| {
            group.capabilities.contains(&capability)
                && group.events.contains(&EventName::ProcessStarted)
        })
    }

    /// All throttling policies declared across instruction groups.
    pub fn throttling_policies(&self) -> impl Iterator<Item = &ThrottlingPolicy> {
        self.instructions
            .iter()
            .flat_map(|group| group.throttling_policies.iter())
    }

    /// Look up a command by id across every instruction group.
    pub fn command(&self, command_id: &str) -> Option<&CommandSpec> {
        self.instructions
            .iter()
            .flat_map(|group| group.commands.iter())
            .find(|command| command.id == command_id)
    }
}
