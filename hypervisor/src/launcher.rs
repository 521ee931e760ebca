//! Starting the (self-daemonizing) QEMU process.

use crate::error::HypervisorError;
use std::path::Path;
use tokio::process::Command;

pub const DEFAULT_QEMU_BINARY: &str = "/usr/bin/qemu-system-x86_64";

/// Run `binary` with `args` and wait for the launcher process to exit.
///
/// QEMU is started with `-daemonize`, so a successful exit means the VM
/// is up in the background and its control sockets are listening.
pub async fn launch(binary: &Path, args: &[String]) -> Result<(), HypervisorError> {
    tracing::info!(binary = %binary.display(), args = ?args, "launching QEMU");

    let output = Command::new(binary).args(args).output().await?;

    if !output.status.success() {
        return Err(HypervisorError::Launch {
            binary: binary.display().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}
