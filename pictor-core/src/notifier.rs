//! In-process notification bus.
//!
//! Fans out `(entity, action, state?)`-keyed notifications to typed or
//! catch-all subscribers inside the host. Emitters may attach a single-shot
//! response callback so a subscriber can answer (capability queries and
//! intent round-trips ride on this). The bus holds only subscriber lists;
//! `destroy` tears every listener down and cancels callbacks still pending.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use pictor_model::events::HostNotification;
use pictor_model::Topic;

use crate::error::{HostError, Result};

/// A notification as delivered to a subscriber, optionally carrying the
/// emitter's response slot.
#[derive(Clone, Debug)]
pub struct Emitted {
    pub notification: HostNotification,
    pub responder: Option<Responder>,
}

/// Single-shot reply slot attached to an emitted notification.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<ResponseSlot>,
}

struct ResponseSlot {
    tx: Mutex<Option<oneshot::Sender<Result<Value>>>>,
}

impl Responder {
    fn new() -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(ResponseSlot {
                    tx: Mutex::new(Some(tx)),
                }),
            },
            rx,
        )
    }

    /// Resolve the emitter with a value. Later calls are no-ops.
    pub fn resolve(&self, value: Value) {
        if let Some(tx) = self.slot.tx.lock().take() {
            let _ = tx.send(Ok(value));
        }
    }

    /// Fail the emitter with an error.
    pub fn fail(&self, error: HostError) {
        if let Some(tx) = self.slot.tx.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Cancel the emitter; used on teardown.
    pub fn cancel(&self) {
        self.fail(HostError::IntentCancelled);
    }

    fn is_pending(&self) -> bool {
        self.slot.tx.lock().is_some()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Awaitable side of a response callback.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

impl ResponseHandle {
    /// Wait for the subscriber's reply. A dropped or destroyed responder
    /// resolves as cancellation.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(HostError::IntentCancelled),
        }
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<Emitted>,
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Emitted>,
}

#[derive(Default)]
struct NotifierState {
    next_id: u64,
    by_topic: HashMap<Topic, Vec<SubscriberEntry>>,
    catch_all: Vec<SubscriberEntry>,
    pending: Vec<Responder>,
    destroyed: bool,
}

/// Process-wide topic bus. Initialised at host start and destroyed last in
/// reverse dependency order; handles are passed explicitly, never reached
/// through module-level globals.
pub struct Notifier {
    state: Arc<RwLock<NotifierState>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Notifier")
            .field("topic_count", &state.by_topic.len())
            .field("catch_all_count", &state.catch_all.len())
            .field("pending_responses", &state.pending.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(NotifierState::default())),
        }
    }

    /// Subscribe to one topic key.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;
        state
            .by_topic
            .entry(topic)
            .or_default()
            .push(SubscriberEntry { id, tx });
        Subscription { id, rx }
    }

    /// Subscribe to every notification regardless of topic.
    pub fn subscribe_all(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;
        state.catch_all.push(SubscriberEntry { id, tx });
        Subscription { id, rx }
    }

    /// Drop one subscriber by id.
    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.write();
        for entries in state.by_topic.values_mut() {
            entries.retain(|entry| entry.id != id);
        }
        state.catch_all.retain(|entry| entry.id != id);
    }

    /// Publish without expecting a reply.
    pub fn emit(&self, notification: HostNotification) {
        self.deliver(notification, None);
    }

    /// Publish with a single-shot response callback; the returned handle
    /// resolves when some subscriber answers, or cancels on teardown.
    pub fn emit_with_response(
        &self,
        notification: HostNotification,
    ) -> ResponseHandle {
        let (responder, rx) = Responder::new();
        {
            let mut state = self.state.write();
            state.pending.retain(Responder::is_pending);
            if state.destroyed {
                responder.cancel();
            } else {
                state.pending.push(responder.clone());
            }
        }
        self.deliver(notification, Some(responder));
        ResponseHandle { rx }
    }

    fn deliver(
        &self,
        notification: HostNotification,
        responder: Option<Responder>,
    ) {
        let state = self.state.read();
        if state.destroyed {
            debug!(topic = %notification.topic, "notifier destroyed, dropping emit");
            return;
        }
        let emitted = Emitted {
            notification,
            responder,
        };
        if let Some(entries) = state.by_topic.get(&emitted.notification.topic)
        {
            for entry in entries {
                let _ = entry.tx.send(emitted.clone());
            }
        }
        for entry in &state.catch_all {
            let _ = entry.tx.send(emitted.clone());
        }
    }

    /// Unregister every listener and cancel callbacks still pending.
    pub fn destroy(&self) {
        let mut state = self.state.write();
        state.destroyed = true;
        state.by_topic.clear();
        state.catch_all.clear();
        for responder in state.pending.drain(..) {
            responder.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pictor_model::{EventAction, EventEntity};

    fn topic() -> Topic {
        Topic::new(EventEntity::Extension, EventAction::Installed)
    }

    #[tokio::test]
    async fn typed_subscriber_receives_matching_topic_only() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe(topic());

        notifier.emit(HostNotification::new(
            Topic::new(EventEntity::Image, EventAction::Created),
            serde_json::json!({}),
        ));
        notifier.emit(HostNotification::new(
            topic(),
            serde_json::json!({ "id": "acme" }),
        ));

        let emitted = sub.rx.recv().await.unwrap();
        assert_eq!(emitted.notification.topic, topic());
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn catch_all_sees_everything() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe_all();
        notifier.emit(HostNotification::new(topic(), serde_json::json!({})));
        notifier.emit(HostNotification::new(
            Topic::new(EventEntity::Process, EventAction::Started),
            serde_json::json!({}),
        ));
        assert!(sub.rx.recv().await.is_some());
        assert!(sub.rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn response_callback_round_trips() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe(topic());
        let handle = notifier
            .emit_with_response(HostNotification::new(
                topic(),
                serde_json::json!({}),
            ));

        let emitted = sub.rx.recv().await.unwrap();
        emitted
            .responder
            .expect("responder attached")
            .resolve(serde_json::json!({ "ok": true }));

        let value = handle.wait().await.unwrap();
        assert_eq!(value, serde_json::json!({ "ok": true }));
    }

    #[tokio::test]
    async fn destroy_cancels_pending_responses_and_listeners() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe(topic());
        let handle = notifier
            .emit_with_response(HostNotification::new(
                topic(),
                serde_json::json!({}),
            ));
        // subscriber never answers
        let _ = sub.rx.recv().await.unwrap();

        notifier.destroy();
        assert!(matches!(
            handle.wait().await,
            Err(HostError::IntentCancelled)
        ));

        // further emits go nowhere
        notifier.emit(HostNotification::new(topic(), serde_json::json!({})));
        assert!(sub.rx.try_recv().is_err());
    }
}
