use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::info;

pub fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Invokes a component's external install handler:
/// `<handler> <component> <version> <artifact_path>`. Exit 0 is success.
pub fn run_handler(handler: &Path, component: &str, version: &str, artifact: &Path) -> Result<()> {
    info!(
        component,
        version,
        handler = %handler.display(),
        "invoking install handler"
    );
    let mut command = Command::new(handler);
    command.arg(component).arg(version).arg(artifact);
    run_command(
        &mut command,
        &format!("install handler {} failed", handler.display()),
    )
}

pub(crate) fn extract_tar_gz(archive_path: &Path, dst: &Path) -> Result<()> {
    run_command(
        Command::new("tar")
            .arg("-xzf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract tar archive",
    )
}
