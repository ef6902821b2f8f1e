//! Child-process supervision.
//!
//! Forks each extension as an isolated child pointed at its directory, with
//! a transient `parameters.json` carrying the extension id, its per-run API
//! key, and the web-services base URL. Lifecycle signals flow upward over a
//! channel; the owning service decides what a `started`, `stopped`, `error`,
//! or `fatal` signal means for extension state.
//!
//! Stopping is cooperative first: the child gets a terminate signal and a
//! grace window before escalation to a forced kill. Where a shell wrapper
//! obscures the real child, the whole process tree is signalled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, warn};

use pictor_model::{ApiKey, ExtensionId, ProcessSignal, ProcessSignalKind};

use crate::error::{HostError, Result};

/// File the child reads at startup from its working directory.
pub const PARAMETERS_FILE_NAME: &str = "parameters.json";

/// Back-off before the single spawn retry.
const START_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Supervisor-wide knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace window between cooperative terminate and forced kill.
    pub stop_grace: Duration,
    /// Base URL written into each child's `parameters.json`.
    pub web_services_base_url: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            web_services_base_url: "http://127.0.0.1:8650".into(),
        }
    }
}

/// Everything needed to fork one extension.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

struct ChildEntry {
    stop_tx: oneshot::Sender<()>,
    wait_task: JoinHandle<()>,
}

/// Tracks live extension children keyed by id. Exclusive owner of every
/// child handle.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    children: Arc<Mutex<HashMap<ExtensionId, ChildEntry>>>,
    signal_tx: mpsc::UnboundedSender<ProcessSignal>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ProcessSupervisor");
        debug.field("config", &self.config);
        match self.children.try_lock() {
            Ok(children) => {
                debug.field("child_count", &children.len());
            }
            Err(_) => {
                debug.field("children", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl ProcessSupervisor {
    /// Build the supervisor plus the stream of upward signals.
    pub fn new(
        config: SupervisorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                children: Arc::new(Mutex::new(HashMap::new())),
                signal_tx,
            },
            signal_rx,
        )
    }

    pub async fn is_running(&self, extension_id: &ExtensionId) -> bool {
        self.children.lock().await.contains_key(extension_id)
    }

    /// Fork one extension. Retries the spawn once after a short back-off;
    /// a second failure is surfaced as [`HostError::ChildStartFailed`].
    pub async fn start_process(
        &self,
        extension_id: &ExtensionId,
        api_key: &ApiKey,
        plan: LaunchPlan,
    ) -> Result<()> {
        {
            let children = self.children.lock().await;
            if children.contains_key(extension_id) {
                debug!(extension = %extension_id, "process already running");
                return Ok(());
            }
        }

        self.write_parameters(extension_id, api_key, &plan.cwd)
            .await?;

        let child = match self.spawn(extension_id, &plan) {
            Ok(child) => child,
            Err(first_err) => {
                warn!(
                    extension = %extension_id,
                    error = %first_err,
                    "spawn failed, retrying once"
                );
                sleep(START_RETRY_BACKOFF).await;
                self.spawn(extension_id, &plan)?
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let wait_task = spawn_wait_task(
            extension_id.clone(),
            child,
            stop_rx,
            self.config.stop_grace,
            plan.cwd.clone(),
            self.signal_tx.clone(),
        );

        self.children.lock().await.insert(
            extension_id.clone(),
            ChildEntry { stop_tx, wait_task },
        );

        let _ = self.signal_tx.send(ProcessSignal::new(
            extension_id.clone(),
            ProcessSignalKind::Started,
        ));
        Ok(())
    }

    /// Start a batch of extensions; failures are reported per item.
    pub async fn start_processes(
        &self,
        batch: Vec<(ExtensionId, ApiKey, LaunchPlan)>,
    ) -> Vec<(ExtensionId, Result<()>)> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for (extension_id, api_key, plan) in batch {
            let outcome =
                self.start_process(&extension_id, &api_key, plan).await;
            outcomes.push((extension_id, outcome));
        }
        outcomes
    }

    /// Stop the listed extensions gracefully, waiting for each to exit.
    pub async fn stop_processes(&self, extension_ids: &[ExtensionId]) {
        for extension_id in extension_ids {
            let entry = {
                let mut children = self.children.lock().await;
                children.remove(extension_id)
            };
            let Some(entry) = entry else { continue };
            let _ = entry.stop_tx.send(());
            if let Err(err) = entry.wait_task.await {
                warn!(
                    extension = %extension_id,
                    error = %err,
                    "wait task ended abnormally"
                );
            }
        }
    }

    /// Stop everything; used on host shutdown.
    pub async fn destroy(&self) {
        let ids: Vec<ExtensionId> = {
            let children = self.children.lock().await;
            children.keys().cloned().collect()
        };
        self.stop_processes(&ids).await;
    }

    async fn write_parameters(
        &self,
        extension_id: &ExtensionId,
        api_key: &ApiKey,
        cwd: &std::path::Path,
    ) -> Result<()> {
        let parameters = json!({
            "extensionId": extension_id,
            "apiKey": api_key,
            "webServicesBaseUrl": self.config.web_services_base_url,
        });
        tokio::fs::write(
            cwd.join(PARAMETERS_FILE_NAME),
            serde_json::to_vec_pretty(&parameters)?,
        )
        .await?;
        Ok(())
    }

    fn spawn(
        &self,
        extension_id: &ExtensionId,
        plan: &LaunchPlan,
    ) -> Result<Child> {
        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .current_dir(&plan.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| HostError::ChildStartFailed {
                extension_id: extension_id.clone(),
                reason: format!("{}: {err}", plan.program),
            })?;

        if let Some(stderr) = child.stderr.take() {
            let extension = extension_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(extension = %extension, "stderr: {line}");
                }
            });
        }
        Ok(child)
    }
}

fn spawn_wait_task(
    extension_id: ExtensionId,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    cwd: PathBuf,
    signal_tx: mpsc::UnboundedSender<ProcessSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => ProcessSignal::new(
                    extension_id.clone(),
                    ProcessSignalKind::Stopped,
                ),
                Ok(status) => ProcessSignal::new(
                    extension_id.clone(),
                    ProcessSignalKind::Fatal,
                )
                .with_value(format!("exited with {status}")),
                Err(err) => ProcessSignal::new(
                    extension_id.clone(),
                    ProcessSignalKind::Fatal,
                )
                .with_value(err.to_string()),
            },
            _ = stop_rx => {
                terminate_with_grace(&extension_id, &mut child, grace).await;
                ProcessSignal::new(
                    extension_id.clone(),
                    ProcessSignalKind::Stopped,
                )
            }
        };

        // The parameters file is transient: gone once the run ends.
        let _ = tokio::fs::remove_file(cwd.join(PARAMETERS_FILE_NAME)).await;
        let _ = signal_tx.send(signal);
    })
}

async fn terminate_with_grace(
    extension_id: &ExtensionId,
    child: &mut Child,
    grace: Duration,
) {
    signal_tree(extension_id, child, TreeSignal::Terminate);
    if timeout(grace, child.wait()).await.is_err() {
        warn!(
            extension = %extension_id,
            "grace window elapsed, killing process tree"
        );
        signal_tree(extension_id, child, TreeSignal::Kill);
        let _ = child.wait().await;
    }
}

#[derive(Debug, Clone, Copy)]
enum TreeSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_tree(
    extension_id: &ExtensionId,
    child: &mut Child,
    signal: TreeSignal,
) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(root) = child.id() else { return };
    let sig = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };
    // Children first so a wrapping shell cannot respawn what we just
    // signalled.
    let mut pids = descendant_pids(root);
    pids.push(root);
    for pid in pids {
        if let Err(err) = kill(Pid::from_raw(pid as i32), sig) {
            debug!(
                extension = %extension_id,
                pid,
                error = %err,
                "signal delivery failed"
            );
        }
    }
}

#[cfg(not(unix))]
fn signal_tree(
    _extension_id: &ExtensionId,
    child: &mut Child,
    signal: TreeSignal,
) {
    if matches!(signal, TreeSignal::Kill) {
        // Forced kill only; cooperative termination has no portable
        // equivalent here.
        let _ = child.start_kill();
    }
}

/// Walk the process tree below `root`, deepest first.
#[cfg(target_os = "linux")]
fn descendant_pids(root: u32) -> Vec<u32> {
    let mut by_parent: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) =
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
        else {
            continue;
        };
        // field 4 of /proc/<pid>/stat, after the parenthesised comm
        if let Some(ppid) = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().nth(1))
            .and_then(|ppid| ppid.parse::<u32>().ok())
        {
            by_parent.entry(ppid).or_default().push(pid);
        }
    }

    let mut collected = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(children) = by_parent.get(&pid) {
            for &child in children {
                frontier.push(child);
                collected.push(child);
            }
        }
    }
    collected.reverse();
    collected
}

#[cfg(all(unix, not(target_os = "linux")))]
fn descendant_pids(_root: u32) -> Vec<u32> {
    Vec::new()
}
