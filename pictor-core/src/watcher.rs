//! Unpacked-extension watcher.
//!
//! Scans a directory of live-developed extensions, links each one into the
//! installed tree, and installs it like any other extension. Every linked
//! manifest is then watched; a change stops the process, re-runs validation,
//! and restarts it. Raw notify events are debounced behind a short
//! stability window so editor write bursts coalesce into one reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use notify::{
    Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use pictor_config::WatchConfig;
use pictor_model::manifest::MANIFEST_FILE_NAME;
use pictor_model::ExtensionId;

use crate::error::{HostError, Result};
use crate::host::{ExtensionHost, WatchTerminator};

/// Host operations the watcher drives. Split out so the watcher tests run
/// against a recording stub.
#[async_trait]
pub trait UnpackedLifecycle: Send + Sync {
    /// Link and install an unpacked source directory; returns its id.
    async fn install_unpacked(&self, source: &Path) -> Result<ExtensionId>;

    /// Stop, re-validate, and restart after a manifest change.
    async fn reload_unpacked(&self, id: &ExtensionId) -> Result<()>;

    /// Hand over the cancel handle for this extension's watch.
    fn attach_watch_terminator(
        &self,
        id: &ExtensionId,
        terminator: WatchTerminator,
    );
}

#[cfg(unix)]
#[async_trait]
impl UnpackedLifecycle for Arc<ExtensionHost> {
    async fn install_unpacked(&self, source: &Path) -> Result<ExtensionId> {
        ExtensionHost::install_unpacked(self, source).await
    }

    async fn reload_unpacked(&self, id: &ExtensionId) -> Result<()> {
        ExtensionHost::reload_unpacked(self, id).await
    }

    fn attach_watch_terminator(
        &self,
        id: &ExtensionId,
        terminator: WatchTerminator,
    ) {
        ExtensionHost::attach_watch_terminator(self, id, terminator)
    }
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

/// Watches the unpacked-extensions directory and hot-reloads on manifest
/// change.
pub struct UnpackedWatcher {
    config: WatchConfig,
    unpacked_root: PathBuf,
    lifecycle: Arc<dyn UnpackedLifecycle>,
}

impl std::fmt::Debug for UnpackedWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpackedWatcher")
            .field("unpacked_root", &self.unpacked_root)
            .field("config", &self.config)
            .finish()
    }
}

impl UnpackedWatcher {
    pub fn new(
        config: WatchConfig,
        unpacked_root: impl Into<PathBuf>,
        lifecycle: Arc<dyn UnpackedLifecycle>,
    ) -> Self {
        Self {
            config,
            unpacked_root: unpacked_root.into(),
            lifecycle,
        }
    }

    /// Install every unpacked extension found at the root and start
    /// watching its manifest. Broken entries are skipped with a warning.
    pub async fn scan_and_install(&self) -> Result<Vec<ExtensionId>> {
        let mut installed = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.unpacked_root).await
        {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(installed);
            }
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() || !path.join(MANIFEST_FILE_NAME).is_file() {
                continue;
            }
            match self.lifecycle.install_unpacked(&path).await {
                Ok(id) => {
                    self.watch(id.clone(), path).await?;
                    installed.push(id);
                }
                Err(err) => {
                    warn!(
                        directory = %path.display(),
                        error = %err,
                        "skipping unpacked extension"
                    );
                }
            }
        }
        info!(count = installed.len(), "unpacked extensions installed");
        Ok(installed)
    }

    /// Watch one source directory's manifest and reload on change.
    pub async fn watch(
        &self,
        extension_id: ExtensionId,
        source: PathBuf,
    ) -> Result<()> {
        let capacity = 256;
        let (tx, rx) = mpsc::channel::<WatchMessage>(capacity);

        let watch_dir = source.clone();
        let watcher =
            spawn_blocking(move || init_watcher(&watch_dir, tx))
                .await
                .map_err(|err| HostError::Internal(err.to_string()))??;

        let flush_task = spawn_reload_loop(
            extension_id.clone(),
            Arc::clone(&self.lifecycle),
            rx,
            Duration::from_millis(self.config.debounce_window_ms.max(1)),
        );

        let terminator: WatchTerminator = Box::new(move || {
            // Dropping the watcher stops the notify stream.
            drop(watcher);
            flush_task.abort();
        });
        self.lifecycle
            .attach_watch_terminator(&extension_id, terminator);
        Ok(())
    }
}

fn init_watcher(
    source: &Path,
    tx: mpsc::Sender<WatchMessage>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.blocking_send(WatchMessage::Event(event));
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        HostError::Internal(format!(
            "failed to create watcher for {}: {err}",
            source.display()
        ))
    })?;

    watcher
        .watch(source, RecursiveMode::NonRecursive)
        .map_err(|err| {
            HostError::Internal(format!(
                "failed to watch {}: {err}",
                source.display()
            ))
        })?;
    Ok(watcher)
}

/// Debounce loop: coalesce manifest-touching events within the stability
/// window, then reload once.
fn spawn_reload_loop(
    extension_id: ExtensionId,
    lifecycle: Arc<dyn UnpackedLifecycle>,
    mut rx: mpsc::Receiver<WatchMessage>,
    debounce_window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut dirty = false;

        loop {
            let msg = if dirty {
                match timeout(debounce_window, rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        dirty = false;
                        if let Err(err) =
                            lifecycle.reload_unpacked(&extension_id).await
                        {
                            warn!(
                                extension = %extension_id,
                                error = %err,
                                "hot reload failed"
                            );
                        }
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            let Some(msg) = msg else { break };
            match msg {
                WatchMessage::Event(event) => {
                    if touches_manifest(&event) {
                        debug!(extension = %extension_id, "manifest changed");
                        dirty = true;
                    }
                }
                WatchMessage::Error(error) => {
                    warn!(extension = %extension_id, error, "watch error");
                }
            }
        }
    })
}

fn touches_manifest(event: &Event) -> bool {
    event.paths.iter().any(|path| {
        path.file_name()
            .map(|name| name == MANIFEST_FILE_NAME)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingLifecycle {
        installs: Mutex<Vec<PathBuf>>,
        reloads: Mutex<Vec<ExtensionId>>,
        terminators: Mutex<Vec<WatchTerminator>>,
    }

    #[async_trait]
    impl UnpackedLifecycle for RecordingLifecycle {
        async fn install_unpacked(
            &self,
            source: &Path,
        ) -> Result<ExtensionId> {
            self.installs.lock().push(source.to_path_buf());
            let name = source.file_name().unwrap().to_str().unwrap();
            ExtensionId::parse(name)
                .map_err(|err| HostError::Internal(err.to_string()))
        }

        async fn reload_unpacked(&self, id: &ExtensionId) -> Result<()> {
            self.reloads.lock().push(id.clone());
            Ok(())
        }

        fn attach_watch_terminator(
            &self,
            _id: &ExtensionId,
            terminator: WatchTerminator,
        ) {
            self.terminators.lock().push(terminator);
        }
    }

    fn write_manifest(dir: &Path, id: &str) {
        std::fs::write(
            dir.join(MANIFEST_FILE_NAME),
            serde_json::json!({
                "id": id,
                "version": "0.1.0",
                "name": id,
                "description": "fixture",
                "runtimes": [{ "environment": "node" }],
                "instructions": [{ "events": ["ProcessStarted"] }],
                "settings": { "type": "object" }
            })
            .to_string(),
        )
        .unwrap();
    }

    fn quick_config() -> WatchConfig {
        WatchConfig {
            debounce_window_ms: 50,
            poll_interval_ms: 20,
        }
    }

    #[tokio::test]
    async fn scan_installs_every_directory_with_a_manifest() {
        let root = tempfile::tempdir().unwrap();
        for name in ["dev-one", "dev-two"] {
            let dir = root.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            write_manifest(&dir, name);
        }
        // a stray file and an empty dir are ignored
        std::fs::write(root.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir_all(root.path().join("empty")).unwrap();

        let lifecycle = Arc::new(RecordingLifecycle::default());
        let watcher = UnpackedWatcher::new(
            quick_config(),
            root.path(),
            Arc::clone(&lifecycle) as Arc<dyn UnpackedLifecycle>,
        );
        let mut installed = watcher.scan_and_install().await.unwrap();
        installed.sort();
        let names: Vec<&str> =
            installed.iter().map(|id| id.as_str()).collect();
        assert_eq!(names, vec!["dev-one", "dev-two"]);
        assert_eq!(lifecycle.terminators.lock().len(), 2);
    }

    #[tokio::test]
    async fn manifest_edit_triggers_a_single_reload() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("hot");
        std::fs::create_dir_all(&dir).unwrap();
        write_manifest(&dir, "hot");

        let lifecycle = Arc::new(RecordingLifecycle::default());
        let watcher = UnpackedWatcher::new(
            quick_config(),
            root.path(),
            Arc::clone(&lifecycle) as Arc<dyn UnpackedLifecycle>,
        );
        watcher.scan_and_install().await.unwrap();

        // burst of writes within the window coalesces
        write_manifest(&dir, "hot");
        write_manifest(&dir, "hot");

        for _ in 0..100 {
            if !lifecycle.reloads.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let reloads = lifecycle.reloads.lock();
        assert_eq!(reloads.len(), 1);
        assert_eq!(reloads[0].as_str(), "hot");
    }

    #[tokio::test]
    async fn unrelated_files_do_not_reload() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("quiet");
        std::fs::create_dir_all(&dir).unwrap();
        write_manifest(&dir, "quiet");

        let lifecycle = Arc::new(RecordingLifecycle::default());
        let watcher = UnpackedWatcher::new(
            quick_config(),
            root.path(),
            Arc::clone(&lifecycle) as Arc<dyn UnpackedLifecycle>,
        );
        watcher.scan_and_install().await.unwrap();

        std::fs::write(dir.join("main.js"), "console.log('x')").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(lifecycle.reloads.lock().is_empty());
    }
}
