use std::sync::Arc;

use pictor_config::Config;
use pictor_core::ExtensionHost;

/// Server application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<ExtensionHost>,
    pub config: Arc<Config>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("host", &self.host)
            .finish()
    }
}
