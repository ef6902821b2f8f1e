//! Extension host facade.
//!
//! Owns per-extension runtime state and wires the registry, installer,
//! supervisor, router, throttle, dispatcher, and synchronisation engine
//! into the lifecycle the API surface exposes: install, update, uninstall,
//! pause, resume, synchronise, capability queries, and command dispatch.
//!
//! Components start leaves-first and shut down in reverse dependency order.
//! Extension failures never take the host down: a bad manifest is skipped,
//! a fatal child latches that one extension into `Error` and nothing else.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::Mutex as SyncMutex;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use pictor_config::ExtensionsConfig;
use pictor_model::events::HostNotification;
use pictor_model::manifest::{
    Capability, CommandEntity, EventName, ExtensionManifest,
};
use pictor_model::{
    ApiKey, EventAction, EventEntity, EventMessage, ExtendedManifest,
    ExtensionId, ExtensionStatus, ImageId, ProcessSignal, ProcessSignalKind,
    RegistryStatus, Topic,
};

use crate::auth::AuthGuard;
use crate::dispatcher::{CapabilityDispatcher, CapabilityOutcome};
use crate::error::{HostError, Result};
use crate::installer::Installer;
use crate::manifest_rules::check_against_schema;
use crate::notifier::Notifier;
use crate::persistence::{
    AttachmentStore, ComputeResultStore, ImageCatalog, SettingsStore,
    VectorStore,
};
use crate::provision::{RuntimeProvisioner, launcher_for};
use crate::registry::ExtensionRegistry;
use crate::router::{ConnectionRouter, RouterSignal};
use crate::supervisor::{LaunchPlan, ProcessSupervisor, SupervisorConfig};
use crate::sync::SyncEngine;
use crate::throttle::ThrottleScheduler;

/// Continuation parked until the extension's first successful connection.
type PendingRunnable = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Cancels an unpacked extension's manifest watch.
pub type WatchTerminator = Box<dyn FnOnce() + Send>;

/// Who is invoking a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Management API with full rights.
    Admin,
    /// An authenticated extension; may only address itself.
    Extension(ExtensionId),
}

impl Caller {
    fn authorise(&self, target: &ExtensionId) -> Result<()> {
        match self {
            Caller::Admin => Ok(()),
            Caller::Extension(bound) if bound == target => Ok(()),
            Caller::Extension(_) => {
                Err(HostError::Forbidden(target.clone()))
            }
        }
    }
}

#[derive(Default)]
struct ExtensionState {
    status: Option<ExtensionStatus>,
    connected: bool,
    error_latched: bool,
    api_key: Option<ApiKey>,
    pending_runnables: Vec<PendingRunnable>,
    watch_terminator: Option<WatchTerminator>,
}

/// Storage ports the host is wired to.
pub struct HostStores {
    pub catalog: Arc<dyn ImageCatalog>,
    pub features: Arc<dyn ComputeResultStore>,
    pub tags: Arc<dyn ComputeResultStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub vectors: Arc<dyn VectorStore>,
}

impl std::fmt::Debug for HostStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostStores")
    }
}

pub struct ExtensionHost {
    config: ExtensionsConfig,
    registry: ExtensionRegistry,
    installer: Installer,
    supervisor: ProcessSupervisor,
    router: Arc<ConnectionRouter>,
    dispatcher: CapabilityDispatcher,
    throttle: ThrottleScheduler,
    sync: SyncEngine,
    notifier: Arc<Notifier>,
    auth: Arc<dyn AuthGuard>,
    settings: Arc<dyn SettingsStore>,
    states: DashMap<ExtensionId, SyncMutex<ExtensionState>>,
    locks: DashMap<ExtensionId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("registry", &self.registry)
            .field("tracked", &self.states.len())
            .finish()
    }
}

impl ExtensionHost {
    /// Wire every component and start the signal pumps. Leaves first:
    /// notifier, throttle, then the archive-facing installer, supervisor,
    /// router, dispatcher, and sync engine on top.
    pub fn new(
        config: ExtensionsConfig,
        stores: HostStores,
        provisioner: Arc<dyn RuntimeProvisioner>,
        auth: Arc<dyn AuthGuard>,
    ) -> Arc<Self> {
        let notifier = Arc::new(Notifier::new());
        let throttle = ThrottleScheduler::new();
        let registry = ExtensionRegistry::new(&config.root);

        let installer = Installer::new(
            registry.clone(),
            provisioner,
            Arc::clone(&stores.features),
            Arc::clone(&stores.tags),
            Arc::clone(&stores.settings),
            Arc::clone(&stores.attachments),
            Arc::clone(&stores.vectors),
            Arc::clone(&notifier),
        );

        let (supervisor, supervisor_rx) =
            ProcessSupervisor::new(SupervisorConfig {
                stop_grace: Duration::from_millis(config.stop_grace_ms),
                web_services_base_url: config.web_services_base_url.clone(),
            });

        let (router, router_rx) =
            ConnectionRouter::new(Arc::clone(&auth), Arc::clone(&notifier));
        let router = Arc::new(router);

        let dispatcher = CapabilityDispatcher::new(
            registry.clone(),
            Arc::clone(&router),
            Duration::from_millis(config.connect_timeout_ms),
        );

        let sync = SyncEngine::new(
            Arc::clone(&stores.catalog),
            Arc::clone(&stores.features),
            Arc::clone(&stores.tags),
            Arc::clone(&stores.vectors),
            Arc::clone(&router),
            throttle.clone(),
        );

        let host = Arc::new(Self {
            config,
            registry,
            installer,
            supervisor,
            router,
            dispatcher,
            throttle,
            sync,
            notifier,
            auth,
            settings: stores.settings,
            states: DashMap::new(),
            locks: DashMap::new(),
        });

        host.clone().spawn_signal_pumps(supervisor_rx, router_rx);
        host
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn auth(&self) -> &Arc<dyn AuthGuard> {
        &self.auth
    }

    fn lock_for(&self, id: &ExtensionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn with_state<R>(
        &self,
        id: &ExtensionId,
        apply: impl FnOnce(&mut ExtensionState) -> R,
    ) -> R {
        let entry = self.states.entry(id.clone()).or_default();
        let mut state = entry.value().lock().unwrap();
        apply(&mut state)
    }

    pub fn status(&self, id: &ExtensionId) -> Option<ExtensionStatus> {
        self.states
            .get(id)
            .and_then(|state| state.lock().unwrap().status)
    }

    pub fn is_connected(&self, id: &ExtensionId) -> bool {
        self.states
            .get(id)
            .map(|state| state.lock().unwrap().connected)
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Signal pumps

    fn spawn_signal_pumps(
        self: Arc<Self>,
        mut supervisor_rx: mpsc::UnboundedReceiver<ProcessSignal>,
        mut router_rx: mpsc::UnboundedReceiver<RouterSignal>,
    ) {
        let host = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(signal) = supervisor_rx.recv().await {
                host.on_process_signal(signal).await;
            }
        });
        tokio::spawn(async move {
            while let Some(signal) = router_rx.recv().await {
                self.on_router_signal(signal).await;
            }
        });
    }

    async fn on_process_signal(&self, signal: ProcessSignal) {
        let id = signal.extension_id.clone();
        match signal.kind {
            ProcessSignalKind::Started => {
                self.with_state(&id, |state| {
                    state.status = Some(ExtensionStatus::Connecting);
                });
                if let Ok(Some(extended)) = self.registry.get(&id).await {
                    self.throttle
                        .register(
                            id.clone(),
                            extended.manifest.throttling_policies(),
                        )
                        .await;
                }
                self.notifier.emit(
                    HostNotification::new(
                        Topic::new(EventEntity::Process, EventAction::Started),
                        json!({ "id": id }),
                    )
                    .for_extension(id),
                );
            }
            ProcessSignalKind::Stopped => {
                self.throttle.remove(&id).await;
                self.with_state(&id, |state| {
                    state.connected = false;
                    if !matches!(
                        state.status,
                        Some(
                            ExtensionStatus::Uninstalling
                                | ExtensionStatus::Error
                        )
                    ) {
                        state.status = Some(ExtensionStatus::Installed);
                    }
                });
                if let Ok(RegistryStatus::Paused) =
                    self.registry.get_status(&id).await
                {
                    self.with_state(&id, |state| {
                        if state.status == Some(ExtensionStatus::Installed) {
                            state.status = Some(ExtensionStatus::Paused);
                        }
                    });
                }
                self.notifier.emit(
                    HostNotification::new(
                        Topic::new(EventEntity::Process, EventAction::Stopped),
                        json!({ "id": id }),
                    )
                    .for_extension(id),
                );
            }
            ProcessSignalKind::Error => {
                warn!(
                    extension = %id,
                    detail = signal.value.as_deref().unwrap_or(""),
                    "extension reported an error"
                );
                self.notifier.emit(
                    HostNotification::new(
                        Topic::new(
                            EventEntity::Extension,
                            EventAction::Notified,
                        )
                        .with_state("error"),
                        json!({ "id": id, "error": signal.value }),
                    )
                    .for_extension(id),
                );
            }
            ProcessSignalKind::Fatal => {
                error!(
                    extension = %id,
                    detail = signal.value.as_deref().unwrap_or(""),
                    "extension failed fatally"
                );
                self.throttle.remove(&id).await;
                self.router.disconnect(&id);
                self.auth.revoke(&id).await;
                self.with_state(&id, |state| {
                    state.error_latched = true;
                    state.connected = false;
                    state.status = Some(ExtensionStatus::Error);
                });
            }
        }
    }

    async fn on_connected(&self, id: &ExtensionId) {
        let runnables = self.with_state(id, |state| {
            state.connected = true;
            state.status = Some(ExtensionStatus::Connected);
            std::mem::take(&mut state.pending_runnables)
        });
        // First event every freshly connected extension sees.
        let started = EventMessage::new(
            EventName::ProcessStarted,
            json!({ "id": id }),
        );
        if let Err(err) = self.router.send_event(id, started).await {
            warn!(extension = %id, error = %err, "ProcessStarted dispatch failed");
        }
        debug!(
            extension = %id,
            drained = runnables.len(),
            "draining pending runnables"
        );
        for runnable in runnables {
            tokio::spawn(runnable());
        }
    }

    async fn on_router_signal(&self, signal: RouterSignal) {
        match signal {
            RouterSignal::Connected(id) => {
                self.on_connected(&id).await;
            }
            RouterSignal::Disconnected(id) => {
                self.with_state(&id, |state| {
                    state.connected = false;
                    // An uncommanded disconnect from Connected is a fault.
                    if state.status == Some(ExtensionStatus::Connected) {
                        state.status = Some(ExtensionStatus::Error);
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle operations

    /// Start every installed, unpaused, runnable extension. Called once at
    /// boot.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        for extended in self.registry.list(true).await? {
            let id = extended.manifest.id.clone();
            if extended.is_paused() {
                self.with_state(&id, |state| {
                    state.status = Some(ExtensionStatus::Paused);
                });
                continue;
            }
            self.with_state(&id, |state| {
                state.status = Some(ExtensionStatus::Installed);
            });
            if let Err(err) = self.start_extension(&id).await {
                warn!(extension = %id, error = %err, "startup failed");
            } else {
                self.queue_sweep(&extended);
            }
        }
        Ok(())
    }

    /// Install a fresh archive or update an existing extension.
    pub async fn install(
        self: &Arc<Self>,
        maybe_existing: Option<&ExtensionId>,
        bytes: Vec<u8>,
    ) -> Result<ExtendedManifest> {
        let staged = self.installer.stage(maybe_existing, bytes).await?;
        let id = staged.manifest().id.clone();

        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        if staged.update {
            self.stop_extension_locked(&id).await;
        }

        let extended = self.installer.materialise(staged).await?;
        self.with_state(&id, |state| {
            state.status = Some(if extended.is_paused() {
                ExtensionStatus::Paused
            } else {
                ExtensionStatus::Installed
            });
            state.error_latched = false;
        });

        if !extended.is_paused() {
            // Start failure leaves the extension installed with status
            // Error; the install itself already succeeded.
            if let Err(err) = self.start_extension(&id).await {
                warn!(extension = %id, error = %err, "post-install start failed");
            }
            self.queue_sweep(&extended);
        }
        Ok(extended)
    }

    /// Tear an extension out completely.
    pub async fn uninstall(&self, id: &ExtensionId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.with_state(id, |state| {
            state.status = Some(ExtensionStatus::Uninstalling);
        });
        self.stop_extension_locked(id).await;
        self.router.disconnect(id);

        if let Some((_, state)) = self.states.remove(id) {
            let mut state = state.into_inner().unwrap();
            if let Some(terminate) = state.watch_terminator.take() {
                terminate();
            }
            state.pending_runnables.clear();
        }
        self.installer.uninstall(id).await?;
        self.locks.remove(id);
        Ok(())
    }

    /// Pause: sentinel on, process stopped, key revoked.
    pub async fn pause(&self, id: &ExtensionId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.registry.pause_or_resume(id, true).await?;
        self.stop_extension_locked(id).await;
        self.with_state(id, |state| {
            state.status = Some(ExtensionStatus::Paused);
        });
        Ok(())
    }

    /// Resume: sentinel off, process started, sweep queued.
    pub async fn resume(self: &Arc<Self>, id: &ExtensionId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.registry.pause_or_resume(id, false).await?;
        self.with_state(id, |state| {
            state.status = Some(ExtensionStatus::Installed);
        });
        self.start_extension(id).await?;
        if let Some(extended) = self.registry.get(id).await? {
            self.queue_sweep(&extended);
        }
        Ok(())
    }

    /// Fork the extension's child process.
    pub async fn start_extension(&self, id: &ExtensionId) -> Result<()> {
        let latched = self
            .states
            .get(id)
            .map(|state| state.lock().unwrap().error_latched)
            .unwrap_or(false);
        if latched {
            return Err(HostError::ChildStartFailed {
                extension_id: id.clone(),
                reason: "error latched until uninstall".into(),
            });
        }

        let Some(extended) = self.registry.get(id).await? else {
            return Err(HostError::NotInstalled(id.clone()));
        };
        if !extended
            .manifest
            .events()
            .contains(&EventName::ProcessStarted)
        {
            debug!(extension = %id, "no ProcessStarted subscription, not forking");
            return Ok(());
        }

        if self.router.is_delegate(id) {
            // In-process implementation: nothing to fork, the delegate is
            // reachable the moment it is registered.
            self.throttle
                .register(
                    id.clone(),
                    extended.manifest.throttling_policies(),
                )
                .await;
            self.on_connected(id).await;
            return Ok(());
        }

        let api_key = self.auth.issue(id).await;
        self.with_state(id, |state| {
            state.api_key = Some(api_key.clone());
        });

        let Some(runtime) = extended.manifest.runtimes.first() else {
            return Err(HostError::ManifestInvariantViolated(
                "no runtime declared".into(),
            ));
        };
        let launcher =
            launcher_for(&extended.directory, runtime.environment);
        let plan = LaunchPlan {
            program: launcher.program,
            args: vec![
                launcher.entry_point,
                extended.directory.to_string_lossy().into_owned(),
            ],
            cwd: extended.directory.clone(),
        };

        if let Err(err) =
            self.supervisor.start_process(id, &api_key, plan).await
        {
            self.auth.revoke(id).await;
            self.with_state(id, |state| {
                state.status = Some(ExtensionStatus::Error);
                state.api_key = None;
            });
            return Err(err);
        }
        Ok(())
    }

    /// Stop the child, revoke its key, drain its limiter. Caller holds the
    /// per-extension lock.
    async fn stop_extension_locked(&self, id: &ExtensionId) {
        // Status first so the disconnect handler doesn't read an
        // uncommanded drop.
        self.with_state(id, |state| {
            if state.status == Some(ExtensionStatus::Connected)
                || state.status == Some(ExtensionStatus::Connecting)
            {
                state.status = Some(ExtensionStatus::Installed);
            }
            state.connected = false;
            state.api_key = None;
            state.pending_runnables.clear();
        });
        // In-process delegates have no socket to drop; they stay attached
        // and reconnect logically on the next start.
        if !self.router.is_delegate(id) {
            self.router.disconnect(id);
        }
        self.supervisor
            .stop_processes(std::slice::from_ref(id))
            .await;
        self.throttle.remove(id).await;
        self.auth.revoke(id).await;
    }

    /// Public stop used by the API surface.
    pub async fn stop_extension(&self, id: &ExtensionId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_extension_locked(id).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Synchronisation

    /// Run the reconciliation sweep now if the extension is connected, or
    /// park it on the pending-runnable queue to fire on first connect.
    pub async fn synchronise(self: &Arc<Self>, id: &ExtensionId) -> Result<()> {
        let Some(extended) = self.registry.get(id).await? else {
            return Err(HostError::NotInstalled(id.clone()));
        };
        if self.is_connected(id) {
            self.sync.sweep(&extended.manifest).await?;
        } else {
            self.queue_sweep(&extended);
        }
        Ok(())
    }

    fn queue_sweep(self: &Arc<Self>, extended: &ExtendedManifest) {
        let id = extended.manifest.id.clone();
        if self.is_connected(&id) {
            let host = Arc::clone(self);
            let manifest = extended.manifest.clone();
            tokio::spawn(async move {
                if let Err(err) = host.sync.sweep(&manifest).await {
                    warn!(extension = %manifest.id, error = %err, "sweep failed");
                }
            });
            return;
        }
        let host = Arc::clone(self);
        let manifest = extended.manifest.clone();
        self.with_state(&id, move |state| {
            state.pending_runnables.push(Box::new(move || {
                Box::pin(async move {
                    if let Err(err) = host.sync.sweep(&manifest).await {
                        warn!(extension = %manifest.id, error = %err, "sweep failed");
                    }
                })
            }));
        });
    }

    /// Demand sweep for one image across one extension.
    pub async fn synchronise_image(
        &self,
        id: &ExtensionId,
        image_id: &ImageId,
    ) -> Result<usize> {
        let Some(extended) = self.registry.get(id).await? else {
            return Err(HostError::NotInstalled(id.clone()));
        };
        self.sync.sweep_image(&extended.manifest, image_id).await
    }

    /// Fan an image lifecycle event out to every subscribed, connected
    /// extension.
    pub async fn notify_image_event(
        &self,
        event: EventName,
        image_id: &ImageId,
    ) -> Result<()> {
        debug_assert!(matches!(
            event,
            EventName::ImageCreated
                | EventName::ImageUpdated
                | EventName::ImageDeleted
        ));
        for extended in self.registry.list(false).await? {
            let id = extended.manifest.id.clone();
            if !extended.manifest.events().contains(&event)
                || !self.is_connected(&id)
            {
                continue;
            }
            let message =
                EventMessage::new(event, json!({ "id": image_id }));
            let outcome = self
                .throttle
                .run(Some(&id), event, async {
                    self.router.send_event(&id, message).await
                })
                .await;
            match outcome {
                Ok(()) => {}
                Err(HostError::LimiterStopped) => {
                    debug!(extension = %id, "limiter drained during image event");
                }
                Err(err) => {
                    warn!(extension = %id, error = %err, "image event dispatch failed");
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Capabilities, commands, settings

    pub async fn run_capability(
        &self,
        capability: Capability,
        payload: Value,
    ) -> Result<CapabilityOutcome> {
        self.dispatcher.run_capability(capability, payload).await
    }

    /// Invoke an image-anchored command; the caller must be authorised for
    /// the target extension and nothing dispatches otherwise.
    pub async fn run_image_command(
        &self,
        caller: &Caller,
        id: &ExtensionId,
        command_id: &str,
        image_ids: Vec<ImageId>,
        parameters: Option<Value>,
    ) -> Result<()> {
        caller.authorise(id)?;
        let manifest = self.loaded_manifest(id).await?;
        let command = manifest
            .command(command_id)
            .filter(|command| {
                matches!(
                    command.on.entity,
                    CommandEntity::Image | CommandEntity::Images
                )
            })
            .ok_or_else(|| HostError::UnknownCommand {
                extension_id: id.clone(),
                command_id: command_id.to_string(),
            })?;
        if let (Some(schema), Some(parameters)) =
            (&command.parameters, &parameters)
        {
            check_against_schema(schema, parameters)?;
        }

        let message = EventMessage::new(
            EventName::ImageRunCommand,
            json!({
                "commandId": command_id,
                "parameters": parameters,
                "imageIds": image_ids,
            }),
        );
        self.throttle
            .run(Some(id), EventName::ImageRunCommand, async {
                self.router.send_event(id, message).await
            })
            .await
    }

    /// Invoke a process-anchored command.
    pub async fn run_process_command(
        &self,
        caller: &Caller,
        id: &ExtensionId,
        command_id: &str,
        parameters: Option<Value>,
    ) -> Result<()> {
        caller.authorise(id)?;
        let manifest = self.loaded_manifest(id).await?;
        let command = manifest
            .command(command_id)
            .filter(|command| command.on.entity == CommandEntity::Process)
            .ok_or_else(|| HostError::UnknownCommand {
                extension_id: id.clone(),
                command_id: command_id.to_string(),
            })?;
        if let (Some(schema), Some(parameters)) =
            (&command.parameters, &parameters)
        {
            check_against_schema(schema, parameters)?;
        }

        let message = EventMessage::new(
            EventName::ProcessRunCommand,
            json!({
                "commandId": command_id,
                "parameters": parameters,
            }),
        );
        self.throttle
            .run(Some(id), EventName::ProcessRunCommand, async {
                self.router.send_event(id, message).await
            })
            .await
    }

    /// Store a settings blob after validating it against the manifest's
    /// settings schema.
    pub async fn update_settings(
        &self,
        id: &ExtensionId,
        value: Value,
    ) -> Result<()> {
        let manifest = self.loaded_manifest(id).await?;
        check_against_schema(&manifest.settings, &value)?;
        self.settings.put(id, value.clone()).await?;
        self.router.notify_settings(id, value).await;
        Ok(())
    }

    pub async fn get_settings(
        &self,
        id: &ExtensionId,
    ) -> Result<Option<Value>> {
        let _ = self.loaded_manifest(id).await?;
        self.settings.get(id).await
    }

    async fn loaded_manifest(
        &self,
        id: &ExtensionId,
    ) -> Result<ExtensionManifest> {
        self.registry
            .get(id)
            .await?
            .map(|extended| extended.manifest)
            .ok_or_else(|| HostError::NotInstalled(id.clone()))
    }

    /// Listing DTO for the API surface.
    pub async fn list(
        &self,
        include_paused: bool,
    ) -> Result<Vec<ExtendedManifest>> {
        self.registry.list(include_paused).await
    }

    // ------------------------------------------------------------------
    // Unpacked extensions

    /// Record the watch-cancel handle for an unpacked extension.
    pub fn attach_watch_terminator(
        &self,
        id: &ExtensionId,
        terminator: WatchTerminator,
    ) {
        self.with_state(id, |state| {
            if let Some(previous) = state.watch_terminator.replace(terminator)
            {
                previous();
            }
        });
    }

    /// Install an extension that lives as a plain source directory: link it
    /// into the installed tree and run it like any other extension. Only
    /// the symlink is ever created on disk.
    #[cfg(unix)]
    pub async fn install_unpacked(
        self: &Arc<Self>,
        source: &Path,
    ) -> Result<ExtensionId> {
        let manifest = self.installer.validate_directory(source).await?;
        let id = manifest.id.clone();

        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let link = self.registry.directory(&id);
        match tokio::fs::symlink_metadata(&link).await {
            Ok(meta) if meta.file_type().is_symlink() => {}
            Ok(_) => {
                return Err(HostError::AlreadyInstalled(id));
            }
            Err(_) => {
                tokio::fs::create_dir_all(self.registry.root()).await?;
                tokio::fs::symlink(source, &link).await?;
            }
        }

        let Some(extended) = self.registry.get(&id).await? else {
            return Err(HostError::Internal(format!(
                "unpacked extension {id} not visible after linking"
            )));
        };
        self.with_state(&id, |state| {
            state.status = Some(if extended.is_paused() {
                ExtensionStatus::Paused
            } else {
                ExtensionStatus::Installed
            });
        });
        if !extended.is_paused() {
            self.start_extension(&id).await?;
            self.queue_sweep(&extended);
        }
        Ok(id)
    }

    /// Hot reload after a manifest change: stop, re-validate, restart.
    #[cfg(unix)]
    pub async fn reload_unpacked(
        self: &Arc<Self>,
        id: &ExtensionId,
    ) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.stop_extension_locked(id).await;

        let link = self.registry.directory(id);
        let source = tokio::fs::read_link(&link).await.map_err(|err| {
            HostError::Internal(format!(
                "{id} is not an unpacked extension: {err}"
            ))
        })?;
        self.installer.validate_directory(&source).await?;

        let Some(extended) = self.registry.get(id).await? else {
            return Err(HostError::NotInstalled(id.clone()));
        };
        if !extended.is_paused() {
            self.start_extension(id).await?;
            self.queue_sweep(&extended);
        }
        info!(extension = %id, "unpacked extension reloaded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown

    /// Stop everything in reverse dependency order.
    pub async fn shutdown(&self) {
        info!("extension host shutting down");
        let ids: Vec<ExtensionId> = self
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            if let Some(state) = self.states.get(id) {
                let mut state = state.lock().unwrap();
                if let Some(terminate) = state.watch_terminator.take() {
                    terminate();
                }
            }
        }
        self.supervisor.destroy().await;
        for id in &ids {
            self.auth.revoke(id).await;
        }
        self.router.destroy();
        self.throttle.destroy().await;
        self.notifier.destroy();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::auth::InMemoryAuthGuard;
    use crate::persistence::memory::{
        MemoryAttachmentStore, MemoryComputeResultStore, MemoryImageCatalog,
        MemorySettingsStore, MemoryVectorStore,
    };
    use crate::provision::NoopProvisioner;
    use crate::router::ExtensionDelegate;

    fn targz(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(
            std::io::Cursor::new(Vec::new()),
            Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let data = contents.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder
            .into_inner()
            .unwrap()
            .finish()
            .unwrap()
            .into_inner()
    }

    fn tagger_manifest_json(id: &str) -> String {
        serde_json::json!({
            "id": id,
            "version": "0.1.0",
            "name": id,
            "description": "fixture",
            "runtimes": [{ "environment": "python" }],
            "instructions": [{
                "events": [
                    "ProcessStarted",
                    "ImageCreated",
                    "ImageUpdated",
                    "ImageComputeTags",
                    "ImageRunCommand"
                ],
                "capabilities": ["ImageTags"],
                "commands": [{
                    "id": "retag",
                    "on": { "entity": "Images" }
                }]
            }],
            "settings": {
                "type": "object",
                "properties": { "model": { "type": "string" } },
                "additionalProperties": false
            }
        })
        .to_string()
    }

    struct Fixture {
        host: Arc<ExtensionHost>,
        catalog: Arc<MemoryImageCatalog>,
        root: tempfile::TempDir,
    }

    /// Extensions in these tests run as in-process delegates, so lifecycle
    /// and event flow exercise the real paths without interpreter forks.
    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemoryImageCatalog::new());
        let config = ExtensionsConfig {
            root: root.path().to_path_buf(),
            unpacked_root: None,
            web_services_base_url: "http://127.0.0.1:0".into(),
            stop_grace_ms: 500,
            connect_timeout_ms: 300,
        };
        let host = ExtensionHost::new(
            config,
            HostStores {
                catalog: Arc::clone(&catalog) as Arc<dyn ImageCatalog>,
                features: Arc::new(MemoryComputeResultStore::new()),
                tags: Arc::new(MemoryComputeResultStore::new()),
                settings: Arc::new(MemorySettingsStore::new()),
                attachments: Arc::new(MemoryAttachmentStore::new()),
                vectors: Arc::new(MemoryVectorStore::new()),
            },
            Arc::new(NoopProvisioner),
            Arc::new(InMemoryAuthGuard::new()),
        );
        Fixture {
            host,
            catalog,
            root,
        }
    }

    struct Recorder {
        seen: Arc<SyncMutex<Vec<EventMessage>>>,
    }

    #[async_trait]
    impl ExtensionDelegate for Recorder {
        async fn handle_event(
            &self,
            message: EventMessage,
        ) -> Result<Option<Value>> {
            self.seen.lock().push(message);
            Ok(None)
        }
    }

    fn attach_recorder(
        host: &Arc<ExtensionHost>,
        id: &ExtensionId,
    ) -> Arc<SyncMutex<Vec<EventMessage>>> {
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        host.router().register_delegate(
            id.clone(),
            Arc::new(Recorder {
                seen: Arc::clone(&seen),
            }),
        );
        seen
    }

    fn tagger_archive(id: &str) -> Vec<u8> {
        targz(&[
            ("manifest.json", &tagger_manifest_json(id)),
            ("main.py", "pass"),
        ])
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn install_and_converge_sweeps_untagged_images() {
        let fx = fixture();
        let img_a = ImageId::new();
        let img_b = ImageId::new();
        fx.catalog.insert(img_a);
        fx.catalog.insert(img_b);

        // pre-wire the delegate so the extension counts as connected by
        // the time the post-install sweep fires
        let id = ExtensionId::parse("converge").unwrap();
        let seen = attach_recorder(&fx.host, &id);

        fx.host
            .install(None, tagger_archive("converge"))
            .await
            .unwrap();

        wait_for(|| {
            seen.lock()
                .iter()
                .filter(|m| m.channel == EventName::ImageComputeTags)
                .count()
                == 2
        })
        .await;

        let seen = seen.lock();
        let ids: Vec<String> = seen
            .iter()
            .filter(|m| m.channel == EventName::ImageComputeTags)
            .map(|m| m.value["id"].as_str().unwrap().to_string())
            .collect();
        assert!(ids.contains(&img_a.to_string()));
        assert!(ids.contains(&img_b.to_string()));
        // the connect handshake delivered ProcessStarted as well
        assert!(
            seen.iter()
                .any(|m| m.channel == EventName::ProcessStarted)
        );
    }

    #[tokio::test]
    async fn command_authorisation_rejects_foreign_extensions() {
        let fx = fixture();
        let id = ExtensionId::parse("ext-x").unwrap();
        let seen = attach_recorder(&fx.host, &id);
        fx.host.install(None, tagger_archive("ext-x")).await.unwrap();

        let foreign = Caller::Extension(ExtensionId::parse("ext-y").unwrap());
        let err = fx
            .host
            .run_image_command(
                &foreign,
                &id,
                "retag",
                vec![ImageId::new()],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Forbidden(_)));
        // nothing was dispatched on the command channel
        assert!(
            seen.lock()
                .iter()
                .all(|m| m.channel != EventName::ImageRunCommand)
        );

        fx.host
            .run_image_command(
                &Caller::Extension(id.clone()),
                &id,
                "retag",
                vec![ImageId::new()],
                None,
            )
            .await
            .unwrap();
        wait_for(|| {
            seen.lock()
                .iter()
                .any(|m| m.channel == EventName::ImageRunCommand)
        })
        .await;
    }

    #[tokio::test]
    async fn unknown_command_is_reported_without_dispatch() {
        let fx = fixture();
        let id = ExtensionId::parse("cmdless").unwrap();
        attach_recorder(&fx.host, &id);
        fx.host
            .install(None, tagger_archive("cmdless"))
            .await
            .unwrap();
        let err = fx
            .host
            .run_image_command(&Caller::Admin, &id, "nope", vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::UnknownCommand { .. }));
    }

    #[tokio::test]
    async fn settings_are_validated_against_the_manifest_schema() {
        let fx = fixture();
        let id = ExtensionId::parse("settable").unwrap();
        attach_recorder(&fx.host, &id);
        fx.host
            .install(None, tagger_archive("settable"))
            .await
            .unwrap();

        fx.host
            .update_settings(&id, serde_json::json!({ "model": "v3" }))
            .await
            .unwrap();
        assert_eq!(
            fx.host.get_settings(&id).await.unwrap(),
            Some(serde_json::json!({ "model": "v3" }))
        );

        let err = fx
            .host
            .update_settings(&id, serde_json::json!({ "unknown": true }))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ManifestInvariantViolated(_)));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let fx = fixture();
        let id = ExtensionId::parse("pauser").unwrap();
        attach_recorder(&fx.host, &id);
        fx.host.install(None, tagger_archive("pauser")).await.unwrap();
        wait_for(|| {
            fx.host.status(&id) == Some(ExtensionStatus::Connected)
        })
        .await;

        fx.host.pause(&id).await.unwrap();
        assert_eq!(fx.host.status(&id), Some(ExtensionStatus::Paused));
        assert_eq!(
            fx.host.registry().get_status(&id).await.unwrap(),
            RegistryStatus::Paused
        );

        fx.host.resume(&id).await.unwrap();
        wait_for(|| {
            fx.host.status(&id) == Some(ExtensionStatus::Connected)
        })
        .await;
        assert_eq!(
            fx.host.registry().get_status(&id).await.unwrap(),
            RegistryStatus::Enabled
        );
    }

    #[tokio::test]
    async fn uninstall_clears_every_trace() {
        let fx = fixture();
        let id = ExtensionId::parse("goner").unwrap();
        attach_recorder(&fx.host, &id);
        fx.host.install(None, tagger_archive("goner")).await.unwrap();

        fx.host.uninstall(&id).await.unwrap();
        assert!(!fx.root.path().join("goner").exists());
        assert!(fx.host.status(&id).is_none());
        assert!(!fx.host.router().is_connected(&id));
        assert!(matches!(
            fx.host.synchronise(&id).await,
            Err(HostError::NotInstalled(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unpacked_install_links_and_reload_restarts() {
        let fx = fixture();
        let source_root = tempfile::tempdir().unwrap();
        let source = source_root.path().join("devtagger");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(
            source.join("manifest.json"),
            tagger_manifest_json("devtagger"),
        )
        .unwrap();

        let id = ExtensionId::parse("devtagger").unwrap();
        let seen = attach_recorder(&fx.host, &id);

        let installed =
            fx.host.install_unpacked(&source).await.unwrap();
        assert_eq!(installed, id);
        // only a symlink lands in the installed tree
        let link = fx.root.path().join("devtagger");
        assert!(std::fs::symlink_metadata(&link)
            .unwrap()
            .file_type()
            .is_symlink());
        let listed = fx.host.list(true).await.unwrap();
        assert!(listed.iter().any(|e| e.unpacked));

        // a reload re-validates and restarts; the delegate stays attached
        fx.catalog.insert(ImageId::new());
        fx.host.reload_unpacked(&id).await.unwrap();
        wait_for(|| {
            fx.host.status(&id) == Some(ExtensionStatus::Connected)
        })
        .await;

        // uninstall removes the link, never the source tree
        drop(seen);
        fx.host.uninstall(&id).await.unwrap();
        assert!(std::fs::symlink_metadata(&link).is_err());
        assert!(source.join("manifest.json").is_file());
    }

    #[tokio::test]
    async fn sweep_waits_for_first_connect() {
        let fx = fixture();
        let image = ImageId::new();
        fx.catalog.insert(image);

        // no delegate yet: install parks the sweep as a pending runnable
        let id = ExtensionId::parse("latecomer").unwrap();
        fx.host
            .install(None, tagger_archive("latecomer"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = attach_recorder(&fx.host, &id);
        wait_for(|| {
            seen.lock()
                .iter()
                .any(|m| m.channel == EventName::ImageComputeTags)
        })
        .await;
    }
}
