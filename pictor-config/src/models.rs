//! Typed configuration models.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level host configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub extensions: ExtensionsConfig,
    pub watch: WatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            extensions: ExtensionsConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl Config {
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.extensions.root)?;
        if let Some(unpacked) = &self.extensions.unpacked_root {
            std::fs::create_dir_all(unpacked)?;
        }
        Ok(())
    }
}

/// Bind address of the HTTP/WS surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8650,
        }
    }
}

/// Relational database connection settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

/// Extension-host specific settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Root of the installed-extensions tree.
    pub root: PathBuf,
    /// Directory of live-developed (unpacked) extensions, if enabled.
    pub unpacked_root: Option<PathBuf>,
    /// Base URL extensions use to call back into the web services.
    pub web_services_base_url: String,
    /// Grace period before a stopping child is force-killed, milliseconds.
    pub stop_grace_ms: u64,
    /// How long a capability call waits for a provider to connect,
    /// milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("extensions"),
            unpacked_root: None,
            web_services_base_url: "http://127.0.0.1:8650".into(),
            stop_grace_ms: 5_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Manifest-watch debounce knobs for unpacked extensions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Stability window before a burst of manifest writes is acted on.
    pub debounce_window_ms: u64,
    /// Poll cadence used when native notifications are unavailable.
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 250,
            poll_interval_ms: 100,
        }
    }
}
