//! Runs PowerShell commands on a remote shell.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::client::{RemoteProcess, RemoteShell};
use super::encoding;
use crate::connection::{Command, CommandResult};
use crate::error::ConnectionError;

/// Runs one [`Command`] on an open shell.
#[async_trait]
pub trait WinRmExecutor: Send + Sync {
    async fn execute(
        &self,
        shell: &dyn RemoteShell,
        command: &Command,
    ) -> Result<CommandResult, ConnectionError>;
}

/// Small commands go out as `-encodedcommand`; larger ones, or ones flagged
/// with `force_command_split`, are staged in a temporary `.ps1` file.
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerShellExecutor;

#[async_trait]
impl WinRmExecutor for PowerShellExecutor {
    async fn execute(
        &self,
        shell: &dyn RemoteShell,
        command: &Command,
    ) -> Result<CommandResult, ConnectionError> {
        if !command.forces_split() && encoding::fits_direct(&command.command) {
            run_direct(shell, command).await
        } else {
            run_chunked(shell, command).await
        }
    }
}

/// Start `command_line` and collect its output and exit code.
pub async fn run_and_collect(
    shell: &dyn RemoteShell,
    command_line: &str,
) -> Result<CommandResult, ConnectionError> {
    let RemoteProcess {
        stdout,
        stderr,
        exit,
    } = shell.execute(command_line).await?;

    let stdout_task = tokio::spawn(drain(stdout));
    let stderr_task = tokio::spawn(drain(stderr));
    let (rc, stdout, stderr) = tokio::join!(exit, stdout_task, stderr_task);

    let rc = rc.map_err(|_| {
        ConnectionError::Transport("Remote process ended without an exit code".to_string())
    })??;
    let stdout = stdout.map_err(|e| ConnectionError::Transport(format!("stdout reader: {}", e)))?;
    let stderr = stderr.map_err(|e| ConnectionError::Transport(format!("stderr reader: {}", e)))?;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        rc,
    })
}

async fn drain(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    buf
}

fn unexpected_rc(command: &Command, result: CommandResult) -> ConnectionError {
    ConnectionError::UnexpectedExitCode {
        command: command.command.clone(),
        rc: result.rc,
        expected: command.expected_rc,
        stdout: result.stdout,
        stderr: result.stderr,
    }
}

/// The exit code is always compared against `expected_rc`; `ignore_rc` only
/// applies to the chunked path.
async fn run_direct(
    shell: &dyn RemoteShell,
    command: &Command,
) -> Result<CommandResult, ConnectionError> {
    log::debug!("Running WinRM command [{}]", command.command);
    let result = run_and_collect(shell, &encoding::encoded_command_line(&command.command)).await?;
    if result.rc != command.expected_rc {
        return Err(unexpected_rc(command, result));
    }
    Ok(result)
}

async fn run_chunked(
    shell: &dyn RemoteShell,
    command: &Command,
) -> Result<CommandResult, ConnectionError> {
    let path = encoding::temp_script_path();
    let chunks = encoding::split_command(&command.command);
    log::debug!(
        "Staging WinRM command in {} ({} chunks)",
        path,
        chunks.len()
    );

    let outcome = stage_and_run(shell, &path, &chunks).await;

    match run_and_collect(shell, &encoding::delete_file_line(&path)).await {
        Ok(result) if result.rc != 0 => {
            log::warn!("Failed to delete {} (rc {}): {}", path, result.rc, result.stderr)
        }
        Err(e) => log::warn!("Failed to delete {}: {}", path, e),
        Ok(_) => {}
    }

    let result = outcome?;
    if !command.ignore_rc && result.rc != command.expected_rc {
        return Err(unexpected_rc(command, result));
    }
    Ok(result)
}

async fn stage_and_run(
    shell: &dyn RemoteShell,
    path: &str,
    chunks: &[String],
) -> Result<CommandResult, ConnectionError> {
    for (index, chunk) in chunks.iter().enumerate() {
        let line = encoding::append_chunk_line(path, chunk);
        let result = run_and_collect(shell, &line).await?;
        if result.rc != 0 {
            return Err(ConnectionError::UnexpectedExitCode {
                command: format!("append chunk {} of {} to {}", index + 1, chunks.len(), path),
                rc: result.rc,
                expected: 0,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
    }
    run_and_collect(shell, &encoding::run_script_line(path)).await
}
