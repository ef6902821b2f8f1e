//! Runtime environment preparation.
//!
//! Every runtime descriptor in a manifest names an interpreter family; the
//! provisioner materialises whatever that family needs inside the extension
//! directory (a virtualenv with pinned requirements for python, an installed
//! `node_modules` tree for node). Preparation is idempotent per family so
//! updates can re-run it safely.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use pictor_model::manifest::RuntimeKind;
use pictor_model::ExtensionId;

use crate::error::{HostError, Result};

/// Prepares the on-disk runtime environment for one interpreter family.
#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    async fn prepare(
        &self,
        extension_id: &ExtensionId,
        directory: &Path,
        runtime: RuntimeKind,
    ) -> Result<()>;
}

/// Shells out to the interpreter toolchains on the host.
#[derive(Debug, Default)]
pub struct CommandProvisioner;

impl CommandProvisioner {
    pub fn new() -> Self {
        Self
    }

    fn python_env(directory: &Path) -> PathBuf {
        directory.join(".venv")
    }

    async fn prepare_python(
        &self,
        extension_id: &ExtensionId,
        directory: &Path,
    ) -> Result<()> {
        let env_dir = Self::python_env(directory);
        if !env_dir.exists() {
            run_step(
                extension_id,
                Command::new("python3")
                    .args(["-m", "venv"])
                    .arg(&env_dir)
                    .current_dir(directory),
            )
            .await?;
        }

        let requirements = directory.join("requirements.txt");
        if requirements.exists() {
            run_step(
                extension_id,
                Command::new(env_dir.join("bin").join("pip"))
                    .args(["install", "--requirement"])
                    .arg(&requirements)
                    .current_dir(directory),
            )
            .await?;
        }
        Ok(())
    }

    async fn prepare_node(
        &self,
        extension_id: &ExtensionId,
        directory: &Path,
    ) -> Result<()> {
        if !directory.join("package.json").exists() {
            debug!(extension = %extension_id, "no package.json, nothing to install");
            return Ok(());
        }
        run_step(
            extension_id,
            Command::new("npm")
                .args(["install", "--omit=dev", "--no-audit", "--no-fund"])
                .current_dir(directory),
        )
        .await
    }
}

async fn run_step(
    extension_id: &ExtensionId,
    command: &mut Command,
) -> Result<()> {
    let rendered = format!("{:?}", command.as_std());
    debug!(extension = %extension_id, command = %rendered, "provisioning step");
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| HostError::RuntimePrepFailed {
            extension_id: extension_id.clone(),
            reason: format!("{rendered}: {err}"),
        })?;
    if !output.status.success() {
        return Err(HostError::RuntimePrepFailed {
            extension_id: extension_id.clone(),
            reason: format!(
                "{rendered} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

#[async_trait]
impl RuntimeProvisioner for CommandProvisioner {
    async fn prepare(
        &self,
        extension_id: &ExtensionId,
        directory: &Path,
        runtime: RuntimeKind,
    ) -> Result<()> {
        info!(extension = %extension_id, %runtime, "preparing runtime environment");
        match runtime {
            RuntimeKind::Python => {
                self.prepare_python(extension_id, directory).await
            }
            RuntimeKind::Node => {
                self.prepare_node(extension_id, directory).await
            }
        }
    }
}

/// Provisioner that prepares nothing; used for extensions whose artefacts
/// ship fully materialised, and throughout the test suite.
#[derive(Debug, Default)]
pub struct NoopProvisioner;

#[async_trait]
impl RuntimeProvisioner for NoopProvisioner {
    async fn prepare(
        &self,
        _extension_id: &ExtensionId,
        _directory: &Path,
        _runtime: RuntimeKind,
    ) -> Result<()> {
        Ok(())
    }
}

impl fmt::Display for RuntimeKindLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.entry_point)
    }
}

/// How a prepared extension is launched: interpreter binary plus the entry
/// point expected at the extension root.
#[derive(Debug, Clone)]
pub struct RuntimeKindLauncher {
    pub program: String,
    pub entry_point: String,
}

/// Launch recipe for an interpreter family, relative to the extension
/// directory.
pub fn launcher_for(directory: &Path, runtime: RuntimeKind) -> RuntimeKindLauncher {
    match runtime {
        RuntimeKind::Python => {
            let venv_python = directory.join(".venv").join("bin").join("python");
            RuntimeKindLauncher {
                program: if venv_python.exists() {
                    venv_python.to_string_lossy().into_owned()
                } else {
                    "python3".to_string()
                },
                entry_point: "main.py".to_string(),
            }
        }
        RuntimeKind::Node => RuntimeKindLauncher {
            program: "node".to_string(),
            entry_point: "main.js".to_string(),
        },
    }
}
