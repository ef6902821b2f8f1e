//! Connection and message routing.
//!
//! One persistent bidirectional connection per extension. Inbound frames are
//! authenticated against the guard, then demultiplexed: log lines relay into
//! host tracing, notifications fan out on the bus, acknowledgements resolve
//! pending per-context callbacks, and intents round-trip through the bus to
//! whoever renders user-facing surfaces.
//!
//! Per extension, frames on one context id keep their emit order (the
//! outbound channel is a FIFO); nothing is guaranteed across context ids.
//! The router exclusively owns live sockets; extensions running in-process
//! (tests, embedded implementations) attach as delegates instead.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, trace, warn};

use pictor_model::events::HostNotification;
use pictor_model::protocol::{
    AcknowledgmentBody, ConnectionBody, Envelope, FrameBody, IntentReply,
    LogLevel, NotificationBody,
};
use pictor_model::{
    ApiKey, ContextId, EventAction, EventEntity, EventMessage, ExtensionId,
    Topic,
};

use crate::auth::AuthGuard;
use crate::error::{HostError, Result};
use crate::notifier::Notifier;

/// Connection-state transitions surfaced to the owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterSignal {
    Connected(ExtensionId),
    Disconnected(ExtensionId),
}

/// In-process extension implementation, used where no child process exists.
///
/// Lifecycle hooks mirror what a child process sees over the socket; only
/// event handling is mandatory.
#[async_trait]
pub trait ExtensionDelegate: Send + Sync {
    /// Handle one dispatched event, optionally returning a reply value.
    async fn handle_event(
        &self,
        message: EventMessage,
    ) -> Result<Option<Value>>;

    /// Called once when the delegate is attached.
    async fn on_ready(&self) {}

    /// Called when the extension's stored settings change.
    async fn on_settings(&self, _settings: Value) {}

    /// Called when the delegate is detached for good.
    async fn on_terminate(&self) {}
}

enum Sink {
    Socket {
        api_key: ApiKey,
        outbound: mpsc::Sender<Envelope>,
        sdk_version: String,
    },
    Delegate(Arc<dyn ExtensionDelegate>),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Socket { sdk_version, .. } => f
                .debug_struct("Sink::Socket")
                .field("sdk_version", sdk_version)
                .finish(),
            Sink::Delegate(_) => f.write_str("Sink::Delegate"),
        }
    }
}

struct PendingReply {
    extension_id: ExtensionId,
    tx: oneshot::Sender<Result<Value>>,
}

/// Server-side endpoint multiplexing extension connections.
pub struct ConnectionRouter {
    auth: Arc<dyn AuthGuard>,
    notifier: Arc<Notifier>,
    connections: Arc<DashMap<ExtensionId, Sink>>,
    pending_replies: DashMap<ContextId, PendingReply>,
    connected_tx: broadcast::Sender<ExtensionId>,
    signal_tx: mpsc::UnboundedSender<RouterSignal>,
}

impl fmt::Debug for ConnectionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRouter")
            .field("connection_count", &self.connections.len())
            .field("pending_replies", &self.pending_replies.len())
            .finish()
    }
}

impl ConnectionRouter {
    pub fn new(
        auth: Arc<dyn AuthGuard>,
        notifier: Arc<Notifier>,
    ) -> (Self, mpsc::UnboundedReceiver<RouterSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (connected_tx, _) = broadcast::channel(64);
        (
            Self {
                auth,
                notifier,
                connections: Arc::new(DashMap::new()),
                pending_replies: DashMap::new(),
                connected_tx,
                signal_tx,
            },
            signal_rx,
        )
    }

    pub fn is_connected(&self, extension_id: &ExtensionId) -> bool {
        self.connections.contains_key(extension_id)
    }

    /// Whether the extension is backed by an in-process delegate rather
    /// than a child process on a socket.
    pub fn is_delegate(&self, extension_id: &ExtensionId) -> bool {
        self.connections
            .get(extension_id)
            .map(|sink| matches!(sink.value(), Sink::Delegate(_)))
            .unwrap_or(false)
    }

    /// Attach an authenticated socket after its opening `connection` frame.
    pub async fn register_connection(
        &self,
        extension_id: ExtensionId,
        api_key: ApiKey,
        body: ConnectionBody,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<()> {
        if !self.auth.verify(&extension_id, &api_key).await {
            return Err(HostError::Forbidden(extension_id));
        }
        if !body.is_open {
            return Err(HostError::Internal(format!(
                "connection frame from {extension_id} with isOpen=false"
            )));
        }
        info!(
            extension = %extension_id,
            sdk_version = %body.sdk_version,
            environment = %body.environment,
            "extension connected"
        );
        self.connections.insert(
            extension_id.clone(),
            Sink::Socket {
                api_key,
                outbound,
                sdk_version: body.sdk_version,
            },
        );
        self.mark_connected(extension_id);
        Ok(())
    }

    /// Attach an in-process implementation in place of a child process.
    pub fn register_delegate(
        &self,
        extension_id: ExtensionId,
        delegate: Arc<dyn ExtensionDelegate>,
    ) {
        self.connections
            .insert(extension_id.clone(), Sink::Delegate(Arc::clone(&delegate)));
        tokio::spawn(async move { delegate.on_ready().await });
        self.mark_connected(extension_id);
    }

    /// Push changed settings to a delegate-backed extension.
    pub async fn notify_settings(
        &self,
        extension_id: &ExtensionId,
        settings: Value,
    ) {
        let delegate = self.connections.get(extension_id).and_then(|sink| {
            match sink.value() {
                Sink::Delegate(delegate) => Some(Arc::clone(delegate)),
                Sink::Socket { .. } => None,
            }
        });
        if let Some(delegate) = delegate {
            delegate.on_settings(settings).await;
        }
    }

    fn mark_connected(&self, extension_id: ExtensionId) {
        let _ = self.connected_tx.send(extension_id.clone());
        let _ = self
            .signal_tx
            .send(RouterSignal::Connected(extension_id));
    }

    /// Detach a connection; every pending call for it rejects with
    /// [`HostError::ExtensionGone`].
    pub fn disconnect(&self, extension_id: &ExtensionId) {
        let Some((_, sink)) = self.connections.remove(extension_id) else {
            return;
        };
        if let Sink::Delegate(delegate) = sink {
            tokio::spawn(async move { delegate.on_terminate().await });
        }
        self.drop_pending_for(extension_id);
        let _ = self
            .signal_tx
            .send(RouterSignal::Disconnected(extension_id.clone()));
        info!(extension = %extension_id, "extension disconnected");
    }

    fn drop_pending_for(&self, extension_id: &ExtensionId) {
        let stale: Vec<ContextId> = self
            .pending_replies
            .iter()
            .filter(|entry| entry.value().extension_id == *extension_id)
            .map(|entry| *entry.key())
            .collect();
        for context_id in stale {
            if let Some((_, pending)) =
                self.pending_replies.remove(&context_id)
            {
                let _ = pending
                    .tx
                    .send(Err(HostError::ExtensionGone(extension_id.clone())));
            }
        }
    }

    /// Block until the extension connects, bounded by `deadline`.
    pub async fn wait_connected(
        &self,
        extension_id: &ExtensionId,
        deadline: Duration,
    ) -> Result<()> {
        let mut events = self.connected_tx.subscribe();
        if self.is_connected(extension_id) {
            return Ok(());
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(connected) if connected == *extension_id => {
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_connected(extension_id) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        timeout(deadline, wait)
            .await
            .map_err(|_| HostError::NotConnected(extension_id.clone()))
    }

    /// Dispatch an event without waiting for a reply. Acknowledgements are
    /// best-effort and logged when they come back negative.
    pub async fn send_event(
        &self,
        extension_id: &ExtensionId,
        message: EventMessage,
    ) -> Result<()> {
        let sink = self
            .connections
            .get(extension_id)
            .ok_or_else(|| HostError::NotConnected(extension_id.clone()))?;
        match sink.value() {
            Sink::Socket {
                api_key, outbound, ..
            } => {
                let envelope = Envelope {
                    extension_id: extension_id.clone(),
                    api_key: api_key.clone(),
                    context_id: Some(message.context_id),
                    body: FrameBody::Events(message),
                };
                let outbound = outbound.clone();
                drop(sink);
                outbound.send(envelope).await.map_err(|_| {
                    HostError::ExtensionGone(extension_id.clone())
                })
            }
            Sink::Delegate(delegate) => {
                let delegate = Arc::clone(delegate);
                drop(sink);
                delegate.handle_event(message).await.map(|_| ())
            }
        }
    }

    /// Dispatch an event and await its callback reply on the same context.
    pub async fn call_event(
        &self,
        extension_id: &ExtensionId,
        message: EventMessage,
    ) -> Result<Value> {
        let sink = self
            .connections
            .get(extension_id)
            .ok_or_else(|| HostError::NotConnected(extension_id.clone()))?;
        match sink.value() {
            Sink::Delegate(delegate) => {
                let delegate = Arc::clone(delegate);
                drop(sink);
                let reply = delegate.handle_event(message).await?;
                Ok(reply.unwrap_or(Value::Null))
            }
            Sink::Socket {
                api_key, outbound, ..
            } => {
                let context_id = message.context_id;
                let (tx, rx) = oneshot::channel();
                self.pending_replies.insert(
                    context_id,
                    PendingReply {
                        extension_id: extension_id.clone(),
                        tx,
                    },
                );
                let envelope = Envelope {
                    extension_id: extension_id.clone(),
                    api_key: api_key.clone(),
                    context_id: Some(context_id),
                    body: FrameBody::Events(message),
                };
                let outbound = outbound.clone();
                drop(sink);
                if outbound.send(envelope).await.is_err() {
                    self.pending_replies.remove(&context_id);
                    return Err(HostError::ExtensionGone(
                        extension_id.clone(),
                    ));
                }
                match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        Err(HostError::ExtensionGone(extension_id.clone()))
                    }
                }
            }
        }
    }

    /// Process one inbound frame from an extension socket.
    pub async fn handle_frame(&self, envelope: Envelope) -> Result<()> {
        let Envelope {
            extension_id,
            api_key,
            context_id,
            body,
        } = envelope;

        if !self.auth.verify(&extension_id, &api_key).await {
            warn!(extension = %extension_id, "rejecting frame with stale credentials");
            return Err(HostError::Forbidden(extension_id));
        }

        match body {
            FrameBody::Connection(_) => {
                // The socket layer registers connections; a repeat here is
                // harmless chatter.
                debug!(extension = %extension_id, "duplicate connection frame");
                Ok(())
            }
            FrameBody::Events(_) | FrameBody::IntentReply(_) => {
                Err(HostError::Internal(format!(
                    "extension {extension_id} sent a host-only frame"
                )))
            }
            FrameBody::Notifications(notification) => {
                self.handle_notification(extension_id, context_id, notification)
                    .await
            }
        }
    }

    async fn handle_notification(
        &self,
        extension_id: ExtensionId,
        context_id: Option<ContextId>,
        notification: NotificationBody,
    ) -> Result<()> {
        match notification {
            NotificationBody::Log(log) => {
                relay_log(&extension_id, log.level, &log.message);
                Ok(())
            }
            NotificationBody::Notification(value) => {
                self.notifier.emit(
                    HostNotification::new(
                        Topic::new(
                            EventEntity::Extension,
                            EventAction::Notified,
                        ),
                        value,
                    )
                    .for_extension(extension_id),
                );
                Ok(())
            }
            NotificationBody::Acknowledgment(ack) => {
                self.resolve_acknowledgment(extension_id, context_id, ack);
                Ok(())
            }
            NotificationBody::Intent(intent) => {
                let Some(context_id) = context_id else {
                    return Err(HostError::Internal(format!(
                        "intent from {extension_id} without a context id"
                    )));
                };
                self.launch_intent(extension_id, context_id, intent);
                Ok(())
            }
        }
    }

    fn resolve_acknowledgment(
        &self,
        extension_id: ExtensionId,
        context_id: Option<ContextId>,
        ack: AcknowledgmentBody,
    ) {
        let Some(context_id) = context_id else {
            debug!(extension = %extension_id, "acknowledgment without context");
            return;
        };
        let Some((_, pending)) = self.pending_replies.remove(&context_id)
        else {
            // Plain receipt for a fire-and-forget dispatch.
            if !ack.success {
                warn!(
                    extension = %extension_id,
                    context = %context_id,
                    "extension failed to process event"
                );
            } else {
                trace!(
                    extension = %extension_id,
                    context = %context_id,
                    "event acknowledged"
                );
            }
            return;
        };
        let outcome = if ack.success {
            Ok(ack.value.unwrap_or(Value::Null))
        } else {
            Err(HostError::Internal(format!(
                "extension {extension_id} reported failure on {context_id}"
            )))
        };
        let _ = pending.tx.send(outcome);
    }

    /// Route an intent onto the bus and reply to the extension when whoever
    /// renders it answers.
    fn launch_intent(
        &self,
        extension_id: ExtensionId,
        context_id: ContextId,
        intent: pictor_model::protocol::IntentBody,
    ) {
        let payload = match serde_json::to_value(&intent) {
            Ok(payload) => payload,
            Err(err) => {
                error!(extension = %extension_id, error = %err, "unserialisable intent");
                return;
            }
        };
        let handle = self.notifier.emit_with_response(
            HostNotification::new(
                Topic::new(EventEntity::Extension, EventAction::Intent),
                payload,
            )
            .for_extension(extension_id.clone()),
        );

        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            let reply = match handle.wait().await {
                Ok(value) => IntentReply::Value(value),
                Err(HostError::IntentCancelled) => IntentReply::Cancel,
                Err(err) => IntentReply::Error(err.to_string()),
            };
            let Some(sink) = connections.get(&extension_id) else {
                debug!(extension = %extension_id, "intent reply after disconnect");
                return;
            };
            if let Sink::Socket {
                api_key, outbound, ..
            } = sink.value()
            {
                let envelope = Envelope {
                    extension_id: extension_id.clone(),
                    api_key: api_key.clone(),
                    context_id: Some(context_id),
                    body: FrameBody::IntentReply(reply),
                };
                let outbound = outbound.clone();
                drop(sink);
                let _ = outbound.send(envelope).await;
            }
        });
    }

    /// Detach everything; pending calls cancel.
    pub fn destroy(&self) {
        let ids: Vec<ExtensionId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.disconnect(&id);
        }
    }
}

fn relay_log(extension_id: &ExtensionId, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => trace!(extension = %extension_id, "{message}"),
        LogLevel::Debug => debug!(extension = %extension_id, "{message}"),
        LogLevel::Info => info!(extension = %extension_id, "{message}"),
        LogLevel::Warn => warn!(extension = %extension_id, "{message}"),
        LogLevel::Error => error!(extension = %extension_id, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthGuard as _, InMemoryAuthGuard};
    use pictor_model::manifest::{EventName, RuntimeKind};

    fn ext(id: &str) -> ExtensionId {
        ExtensionId::parse(id).unwrap()
    }

    fn connection_body() -> ConnectionBody {
        ConnectionBody {
            is_open: true,
            sdk_version: "0.4.0".into(),
            environment: RuntimeKind::Python,
        }
    }

    async fn connected_router() -> (
        Arc<ConnectionRouter>,
        ExtensionId,
        ApiKey,
        mpsc::Receiver<Envelope>,
        mpsc::UnboundedReceiver<RouterSignal>,
        Arc<Notifier>,
    ) {
        let auth = Arc::new(InMemoryAuthGuard::new());
        let notifier = Arc::new(Notifier::new());
        let (router, signals) =
            ConnectionRouter::new(auth.clone(), notifier.clone());
        let router = Arc::new(router);
        let id = ext("wired");
        let key = auth.issue(&id).await;
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        router
            .register_connection(
                id.clone(),
                key.clone(),
                connection_body(),
                outbound_tx,
            )
            .await
            .unwrap();
        (router, id, key, outbound_rx, signals, notifier)
    }

    #[tokio::test]
    async fn stale_credentials_are_rejected() {
        let auth = Arc::new(InMemoryAuthGuard::new());
        let notifier = Arc::new(Notifier::new());
        let (router, _signals) =
            ConnectionRouter::new(auth.clone(), notifier);
        let id = ext("unauth");
        let (tx, _rx) = mpsc::channel(4);
        let err = router
            .register_connection(
                id.clone(),
                ApiKey::new("never-issued"),
                connection_body(),
                tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Forbidden(_)));
    }

    #[tokio::test]
    async fn call_event_resolves_on_acknowledgment_value() {
        let (router, id, key, mut outbound, _signals, _notifier) =
            connected_router().await;

        let message = EventMessage::new(
            EventName::TextComputeEmbeddings,
            serde_json::json!({ "text": "hello" }),
        );

        let call = {
            let router = Arc::clone(&router);
            let id = id.clone();
            tokio::spawn(async move { router.call_event(&id, message).await })
        };

        // the dispatched frame reaches the socket
        let dispatched = outbound.recv().await.unwrap();
        let context_id = dispatched.context_id.unwrap();
        assert!(matches!(dispatched.body, FrameBody::Events(_)));

        // extension answers on the same context
        router
            .handle_frame(Envelope {
                extension_id: id,
                api_key: key,
                context_id: Some(context_id),
                body: FrameBody::Notifications(
                    NotificationBody::Acknowledgment(AcknowledgmentBody {
                        success: true,
                        value: Some(serde_json::json!([0.1, 0.2])),
                    }),
                ),
            })
            .await
            .unwrap();

        let value = call.await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!([0.1, 0.2]));
    }

    #[tokio::test]
    async fn disconnect_rejects_pending_calls_with_extension_gone() {
        let (router, id, _key, _outbound, mut signals, _notifier) =
            connected_router().await;
        assert_eq!(
            signals.recv().await,
            Some(RouterSignal::Connected(id.clone()))
        );

        let call = {
            let router = Arc::clone(&router);
            let id = id.clone();
            let message = EventMessage::new(
                EventName::ImageComputeTags,
                serde_json::json!({ "id": "img-1" }),
            );
            tokio::spawn(async move { router.call_event(&id, message).await })
        };
        // let the call register its pending reply
        tokio::time::sleep(Duration::from_millis(50)).await;

        router.disconnect(&id);
        assert!(matches!(
            call.await.unwrap(),
            Err(HostError::ExtensionGone(_))
        ));
        assert_eq!(
            signals.recv().await,
            Some(RouterSignal::Disconnected(id))
        );
    }

    #[tokio::test]
    async fn wait_connected_times_out_as_not_connected() {
        let auth = Arc::new(InMemoryAuthGuard::new());
        let notifier = Arc::new(Notifier::new());
        let (router, _signals) = ConnectionRouter::new(auth, notifier);
        let err = router
            .wait_connected(&ext("absent"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::NotConnected(_)));
    }

    #[tokio::test]
    async fn intents_round_trip_through_the_notifier() {
        let (router, id, key, mut outbound, _signals, notifier) =
            connected_router().await;
        let mut intents = notifier.subscribe(Topic::new(
            EventEntity::Extension,
            EventAction::Intent,
        ));

        let context_id = ContextId::new();
        router
            .handle_frame(Envelope {
                extension_id: id.clone(),
                api_key: key,
                context_id: Some(context_id),
                body: FrameBody::Notifications(NotificationBody::Intent(
                    pictor_model::protocol::IntentBody::Dialog(
                        serde_json::json!({ "title": "choose" }),
                    ),
                )),
            })
            .await
            .unwrap();

        let emitted = intents.rx.recv().await.unwrap();
        emitted
            .responder
            .unwrap()
            .resolve(serde_json::json!({ "picked": 2 }));

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.context_id, Some(context_id));
        match reply.body {
            FrameBody::IntentReply(IntentReply::Value(value)) => {
                assert_eq!(value, serde_json::json!({ "picked": 2 }));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delegate_sinks_answer_calls_inline() {
        struct Echo;
        #[async_trait]
        impl ExtensionDelegate for Echo {
            async fn handle_event(
                &self,
                message: EventMessage,
            ) -> Result<Option<Value>> {
                Ok(Some(message.value))
            }
        }

        let auth = Arc::new(InMemoryAuthGuard::new());
        let notifier = Arc::new(Notifier::new());
        let (router, _signals) = ConnectionRouter::new(auth, notifier);
        let id = ext("inproc");
        router.register_delegate(id.clone(), Arc::new(Echo));

        let value = router
            .call_event(
                &id,
                EventMessage::new(
                    EventName::ImageComputeFeatures,
                    serde_json::json!({ "id": "img-9" }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({ "id": "img-9" }));
    }
}
