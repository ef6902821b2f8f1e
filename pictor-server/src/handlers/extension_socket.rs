//! The persistent extension socket.
//!
//! One websocket per extension process. The first frame must be a
//! `connection` envelope carrying the per-run API key; the router rejects
//! anything whose `(extensionId, apiKey)` pair is not registered. After
//! that, inbound frames demultiplex through the router and outbound event
//! dispatches drain from an mpsc-backed sender task, preserving per-context
//! emit order.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pictor_model::protocol::{Envelope, FrameBody};
use pictor_model::ExtensionId;

use crate::state::AppState;

/// Handle the websocket upgrade request.
pub async fn extension_socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(100);

    // Outgoing dispatches: envelope -> JSON text frame.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(raw) => {
                    if ws_sender.send(Message::Text(raw.into())).await.is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to serialise outbound frame");
                }
            }
        }
    });

    let mut registered: Option<ExtensionId> = None;

    while let Some(message) = ws_receiver.next().await {
        let raw = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bin)) => {
                String::from_utf8_lossy(bin.as_ref()).into_owned()
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "websocket receive error");
                break;
            }
        };

        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping unparseable frame");
                continue;
            }
        };

        match (&registered, &envelope.body) {
            (None, FrameBody::Connection(body)) => {
                let extension_id = envelope.extension_id.clone();
                match state
                    .host
                    .router()
                    .register_connection(
                        extension_id.clone(),
                        envelope.api_key.clone(),
                        body.clone(),
                        outbound_tx.clone(),
                    )
                    .await
                {
                    Ok(()) => registered = Some(extension_id),
                    Err(err) => {
                        warn!(
                            extension = %extension_id,
                            error = %err,
                            "rejecting connection"
                        );
                        break;
                    }
                }
            }
            (None, _) => {
                warn!(
                    extension = %envelope.extension_id,
                    "frame before connection handshake"
                );
                break;
            }
            (Some(_), _) => {
                if let Err(err) =
                    state.host.router().handle_frame(envelope).await
                {
                    debug!(error = %err, "frame rejected");
                }
            }
        }
    }

    if let Some(extension_id) = registered {
        state.host.router().disconnect(&extension_id);
    }
    writer.abort();
}
