//! Notifier topics and event dispatch payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ContextId, ExtensionId};
use crate::manifest::EventName;

/// Entity an in-process notification is about.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EventEntity {
    Process,
    Image,
    Text,
    Repository,
    Extension,
}

/// Action performed on an [`EventEntity`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    Started,
    Stopped,
    Installed,
    Uninstalled,
    Notified,
    Intent,
    RunCommand,
    ComputeFeatures,
    ComputeEmbeddings,
    ComputeTags,
}

/// Key the in-process notifier routes on: `(entity, action, state?)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub entity: EventEntity,
    pub action: EventAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Topic {
    pub fn new(entity: EventEntity, action: EventAction) -> Self {
        Self {
            entity,
            action,
            state: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{:?}", self.entity, self.action)?;
        if let Some(state) = &self.state {
            write!(f, ".{state}")?;
        }
        Ok(())
    }
}

/// One event dispatch bundled for the `events` channel of an extension
/// socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub channel: EventName,
    pub context_id: ContextId,
    /// Emit timestamp in unix milliseconds.
    pub milliseconds: i64,
    pub value: Value,
}

impl EventMessage {
    pub fn new(channel: EventName, value: Value) -> Self {
        Self {
            channel,
            context_id: ContextId::new(),
            milliseconds: chrono::Utc::now().timestamp_millis(),
            value,
        }
    }
}

/// A notification published on the in-process bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostNotification {
    pub topic: Topic,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<ExtensionId>,
}

impl HostNotification {
    pub fn new(topic: Topic, payload: Value) -> Self {
        Self {
            topic,
            payload,
            extension_id: None,
        }
    }

    pub fn for_extension(mut self, extension_id: ExtensionId) -> Self {
        self.extension_id = Some(extension_id);
        self
    }
}
