//! External command execution
//!
//! kubectl, kustomize, helm, kubeadm and salt are invoked as child processes.
//! A non-zero exit becomes [`Error::Command`] carrying the captured stderr.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Run `program` with `args` and return its stdout
pub async fn run<I, S>(program: &str, args: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_with_stdin(program, args, None).await
}

/// Run `program` with `args`, optionally feeding `stdin`, and return its stdout
pub async fn run_with_stdin<I, S>(program: &str, args: I, stdin: Option<&[u8]>) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program, command = ?command.as_std(), "running external command");

    let mut child = command
        .spawn()
        .map_err(|e| Error::command(program, format!("failed to start: {}", e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input)
            .await
            .map_err(|e| Error::command(program, format!("failed to write stdin: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::command(program, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr.to_string()
        };
        return Err(Error::command(program, message));
    }

    Ok(output.stdout)
}

/// Like [`run`] but decodes stdout as UTF-8 (lossily)
pub async fn run_text<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let stdout = run(program, args).await?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}
