//! Engine CLI execution with line-wise output streaming.
//!
//! Translates a validated request into a `compose` argv, spawns the engine
//! with a scrubbed environment, and pipes stdout/stderr into the operation's
//! broadcaster line by line. Cancellation signals the child but the runner
//! always waits for it, so the exit code is never lost.

use crate::broadcast::{Broadcaster, OperationMessage};
use crate::validate::OperationVerb;
use crate::vault::{CredentialVault, RegistryCredential, VaultError};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to spawn engine command: {0}")]
    Spawn(std::io::Error),

    #[error("failed waiting for engine command: {0}")]
    Wait(std::io::Error),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    docker_bin: String,
    vault: CredentialVault,
}

impl CommandRunner {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        let docker_bin = docker_bin.into();
        let vault = CredentialVault::new(docker_bin.clone());
        Self { docker_bin, vault }
    }

    pub fn with_vault(mut self, vault: CredentialVault) -> Self {
        self.vault = vault;
        self
    }

    /// Assemble the engine argv for a validated request.
    ///
    /// Always `compose <verb> [options] [services]`. For `up`, any caller
    /// supplied `-d`/`--detach` is stripped and a single `-d` is appended
    /// after the options, so the flag appears exactly once.
    pub fn build_args(
        verb: OperationVerb,
        options: &[String],
        services: &[String],
    ) -> Vec<String> {
        let mut args = vec!["compose".to_string(), verb.as_str().to_string()];

        if verb == OperationVerb::Up {
            args.extend(
                options
                    .iter()
                    .filter(|opt| opt.as_str() != "-d" && opt.as_str() != "--detach")
                    .cloned(),
            );
            args.push("-d".to_string());
        } else {
            args.extend(options.iter().cloned());
        }

        args.extend(services.iter().cloned());
        args
    }

    /// Run the engine command for an operation, streaming output into
    /// `broadcaster`. Returns the child's exit code; the caller emits the
    /// terminal frame.
    pub async fn run(
        &self,
        verb: OperationVerb,
        options: &[String],
        services: &[String],
        stack_dir: &Path,
        credentials: &[RegistryCredential],
        broadcaster: Arc<Broadcaster>,
        cancel: CancellationToken,
    ) -> Result<i64, RunnerError> {
        // Vault dir lives for the duration of this call and is removed on
        // every exit path when `_vault` drops.
        let vault = if credentials.is_empty() {
            None
        } else {
            Some(self.vault.build(credentials).await?)
        };

        let args = Self::build_args(verb, options, services);
        info!(stack_dir = %stack_dir.display(), ?args, "spawning engine command");

        let mut command = Command::new(&self.docker_bin);
        command
            .args(&args)
            .current_dir(stack_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", "/tmp")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(vault) = &vault {
            command.env("DOCKER_CONFIG", vault.path());
        }

        let mut child = command.spawn().map_err(RunnerError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = stdout.map(|stdout| {
            let broadcaster = broadcaster.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                forward_lines(stdout, broadcaster, cancel, OperationMessage::stdout).await;
            })
        });
        let stderr_task = stderr.map(|stderr| {
            let broadcaster = broadcaster.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                forward_lines(stderr, broadcaster, cancel, OperationMessage::stderr).await;
            })
        });

        // Wait for exit; on cancellation signal the child first, then keep
        // waiting so the terminal frame carries the real exit status.
        let status = tokio::select! {
            status = child.wait() => status.map_err(RunnerError::Wait)?,
            _ = cancel.cancelled() => {
                warn!("operation cancelled, signalling engine child");
                if let Err(e) = child.start_kill() {
                    warn!("failed to signal engine child: {e}");
                }
                child.wait().await.map_err(RunnerError::Wait)?
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let code = status.code().map(i64::from).unwrap_or(-1);
        debug!(code, "engine command exited");
        Ok(code)
    }
}

async fn forward_lines<R>(
    reader: R,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
    make_message: fn(String) -> OperationMessage,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => break,
        };
        match line {
            Ok(Some(line)) => broadcaster.broadcast(make_message(line)),
            Ok(None) => break,
            Err(e) => {
                debug!("engine output stream ended: {e}");
                break;
            }
        }
    }
}
