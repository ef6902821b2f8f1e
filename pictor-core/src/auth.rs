//! Extension credential guard.
//!
//! The host issues a fresh API key every time an extension process starts
//! and revokes it on stop or uninstall. Inbound socket frames are checked
//! against the currently registered `(extension id, key)` pair. The guard
//! is a port so deployments can back it with an external authority.

use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use rand::RngCore;

use pictor_model::{ApiKey, ExtensionId};

/// Issue, revoke, and verify per-run extension credentials.
#[async_trait]
pub trait AuthGuard: Send + Sync {
    /// Issue and register a fresh key for `extension_id`, replacing any
    /// previous registration.
    async fn issue(&self, extension_id: &ExtensionId) -> ApiKey;

    /// Drop the registration; subsequent frames with the old key fail.
    async fn revoke(&self, extension_id: &ExtensionId);

    /// Whether `(extension_id, key)` is currently registered.
    async fn verify(&self, extension_id: &ExtensionId, key: &ApiKey) -> bool;
}

/// Process-local guard keeping registrations in memory.
#[derive(Default)]
pub struct InMemoryAuthGuard {
    keys: DashMap<ExtensionId, ApiKey>,
}

impl InMemoryAuthGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InMemoryAuthGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryAuthGuard")
            .field("registered", &self.keys.len())
            .finish()
    }
}

fn generate_key() -> ApiKey {
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    ApiKey::new(URL_SAFE_NO_PAD.encode(raw))
}

#[async_trait]
impl AuthGuard for InMemoryAuthGuard {
    async fn issue(&self, extension_id: &ExtensionId) -> ApiKey {
        let key = generate_key();
        self.keys.insert(extension_id.clone(), key.clone());
        key
    }

    async fn revoke(&self, extension_id: &ExtensionId) {
        self.keys.remove(extension_id);
    }

    async fn verify(&self, extension_id: &ExtensionId, key: &ApiKey) -> bool {
        self.keys
            .get(extension_id)
            .map(|registered| registered.value() == key)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(id: &str) -> ExtensionId {
        ExtensionId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn issued_keys_verify_until_revoked() {
        let guard = InMemoryAuthGuard::new();
        let id = ext("keyed");
        let key = guard.issue(&id).await;
        assert!(guard.verify(&id, &key).await);

        guard.revoke(&id).await;
        assert!(!guard.verify(&id, &key).await);
    }

    #[tokio::test]
    async fn reissue_invalidates_the_previous_key() {
        let guard = InMemoryAuthGuard::new();
        let id = ext("rotated");
        let old = guard.issue(&id).await;
        let new = guard.issue(&id).await;
        assert!(!guard.verify(&id, &old).await);
        assert!(guard.verify(&id, &new).await);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_extension() {
        let guard = InMemoryAuthGuard::new();
        let a = ext("ext-a");
        let b = ext("ext-b");
        let key_a = guard.issue(&a).await;
        guard.issue(&b).await;
        assert!(!guard.verify(&b, &key_a).await);
    }
}
