//! Capability dispatch.
//!
//! Selects an extension implementing a requested capability, waits for it to
//! be reachable, and runs the capability's compute event with a response
//! callback. Provider choice is deterministic: first by extension-id sort
//! order.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Duration;
use tracing::debug;

use pictor_model::manifest::Capability;
use pictor_model::{EventMessage, ExtensionId};

use crate::error::{HostError, Result};
use crate::registry::ExtensionRegistry;
use crate::router::ConnectionRouter;

/// Result of a capability query.
#[derive(Debug, Clone)]
pub struct CapabilityOutcome {
    pub extension_id: ExtensionId,
    pub result: Value,
}

/// Owns pending capability calls; everything else is borrowed context.
#[derive(Debug, Clone)]
pub struct CapabilityDispatcher {
    registry: ExtensionRegistry,
    router: Arc<ConnectionRouter>,
    connect_timeout: Duration,
}

impl CapabilityDispatcher {
    pub fn new(
        registry: ExtensionRegistry,
        router: Arc<ConnectionRouter>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            connect_timeout,
        }
    }

    /// Run `capability` against its first provider and await the reply.
    pub async fn run_capability(
        &self,
        capability: Capability,
        payload: Value,
    ) -> Result<CapabilityOutcome> {
        // Paused providers stay in the candidate set; they simply never
        // connect, so the call ends in NotConnected rather than NoProvider.
        let providers = self
            .registry
            .extensions_with_capability(capability, true)
            .await?;
        let Some(provider) = providers.first() else {
            return Err(HostError::NoProvider(capability.to_string()));
        };
        let extension_id = provider.manifest.id.clone();
        debug!(
            %capability,
            extension = %extension_id,
            candidates = providers.len(),
            "dispatching capability"
        );

        self.router
            .wait_connected(&extension_id, self.connect_timeout)
            .await?;

        let message =
            EventMessage::new(capability.compute_event(), payload);
        let result = self.router.call_event(&extension_id, message).await?;
        Ok(CapabilityOutcome {
            extension_id,
            result,
        })
    }
}
