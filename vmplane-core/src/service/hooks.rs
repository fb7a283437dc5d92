//! Lifecycle hook scripts.
//!
//! Every executable file in `<hooks_dir>/<hook>/` is run in name order with
//! `-vmuuid <vm> -reason <reason>`. The first script to exit non-zero fails
//! the operation.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use super::NodeService;
use crate::error::{Error, Result};

pub(super) const VM_PRE_START: &str = "vm-pre-start";
pub(super) const VM_POST_DESTROY: &str = "vm-post-destroy";

pub(super) const REASON_NONE: &str = "none";
pub(super) const REASON_CLEAN_SHUTDOWN: &str = "clean-shutdown";
pub(super) const REASON_HARD_SHUTDOWN: &str = "hard-shutdown";
pub(super) const REASON_CLEAN_REBOOT: &str = "clean-reboot";
pub(super) const REASON_HARD_REBOOT: &str = "hard-reboot";

impl NodeService {
    pub(super) async fn run_hooks(&self, hook: &str, vm: &str, reason: &str) -> Result<()> {
        match &self.config().hooks_dir {
            Some(dir) => run_hooks_in(dir, hook, vm, reason).await,
            None => Ok(()),
        }
    }
}

async fn run_hooks_in(dir: &Path, hook: &str, vm: &str, reason: &str) -> Result<()> {
    let scripts = list_scripts(&dir.join(hook)).await?;
    for script in scripts {
        run_script(&script, vm, reason).await?;
    }
    Ok(())
}

async fn list_scripts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::internal(format!("cannot read {}: {}", dir.display(), e))),
    };

    let mut scripts = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::internal(format!("cannot read {}: {}", dir.display(), e)))?
    {
        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.is_file() && is_executable(&metadata) {
            scripts.push(entry.path());
        }
    }
    scripts.sort();
    Ok(scripts)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

async fn run_script(script: &Path, vm: &str, reason: &str) -> Result<()> {
    let name = script.display().to_string();
    debug!(script = %name, vm_id = %vm, reason, "Running hook");

    let output = Command::new(script)
        .arg("-vmuuid")
        .arg(vm)
        .arg("-reason")
        .arg(reason)
        .output()
        .await
        .map_err(|e| Error::HookFailed {
            script: name.clone(),
            reason: e.to_string(),
            stdout: String::new(),
            stderr: String::new(),
        })?;

    if !output.status.success() {
        return Err(Error::HookFailed {
            script: name,
            reason: format!("exited with {}", output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    info!(script = %name, vm_id = %vm, "Hook completed");
    Ok(())
}
