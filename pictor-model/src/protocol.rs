//! Wire contract for the persistent extension socket.
//!
//! Every frame is a self-describing record carrying the extension identity,
//! its per-run API key, an optional correlation id, and a channel-specific
//! body. The framing itself (websocket text frames carrying JSON) is an
//! implementation detail of the server crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventMessage;
use crate::ids::{ApiKey, ContextId, ExtensionId};
use crate::manifest::RuntimeKind;

/// Envelope shared by every message on the extension socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub extension_id: ExtensionId,
    pub api_key: ApiKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    pub body: FrameBody,
}

/// Channel-discriminated frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameBody {
    /// One message on open, extension → host.
    Connection(ConnectionBody),
    /// Host → extension event dispatch.
    Events(EventMessage),
    /// Extension → host notifications.
    Notifications(NotificationBody),
    /// Host → extension reply resolving a pending intent.
    IntentReply(IntentReply),
}

/// Handshake payload sent once when the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionBody {
    pub is_open: bool,
    pub sdk_version: String,
    pub environment: RuntimeKind,
}

/// Subcategories of the `notifications` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationBody {
    Log(LogNotification),
    Notification(Value),
    Acknowledgment(AcknowledgmentBody),
    Intent(IntentBody),
}

/// Severity levels an extension may log at; relayed into host tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line forwarded from the extension process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogNotification {
    pub level: LogLevel,
    pub message: String,
}

/// Best-effort receipt for a dispatched event. When the event requested a
/// callback reply, `value` carries the result on the same context id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgmentBody {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// User-facing intents an extension can launch; each expects a reply on the
/// same context id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntentBody {
    Parameters(Value),
    Ui(Value),
    Dialog(Value),
    Images(Value),
    Show(Value),
}

/// Outcome delivered back to an awaiting intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntentReply {
    Value(Value),
    Cancel,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::EventName;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope {
            extension_id: ExtensionId::parse("acme-tagger").unwrap(),
            api_key: ApiKey::new("k-123"),
            context_id: Some(ContextId::new()),
            body: FrameBody::Events(EventMessage::new(
                EventName::ImageComputeTags,
                serde_json::json!({ "id": "img-A" }),
            )),
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn connection_frame_shape_matches_the_contract() {
        let raw = serde_json::json!({
            "extensionId": "acme-tagger",
            "apiKey": "k-123",
            "body": {
                "connection": {
                    "isOpen": true,
                    "sdkVersion": "0.4.1",
                    "environment": "python"
                }
            }
        });
        let parsed: Envelope = serde_json::from_value(raw).unwrap();
        match parsed.body {
            FrameBody::Connection(body) => {
                assert!(body.is_open);
                assert_eq!(body.environment, RuntimeKind::Python);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn intent_notifications_parse_by_kind() {
        let raw = serde_json::json!({
            "extensionId": "acme-tagger",
            "apiKey": "k-123",
            "contextId": ContextId::new(),
            "body": {
                "notifications": {
                    "intent": { "dialog": { "title": "Pick a model" } }
                }
            }
        });
        let parsed: Envelope = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            parsed.body,
            FrameBody::Notifications(NotificationBody::Intent(
                IntentBody::Dialog(_)
            ))
        ));
    }
}
