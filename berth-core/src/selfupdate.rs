//! Self-update handoff.
//!
//! An operation targeting the agent's own stack cannot be run in-process:
//! `compose up`/`restart` would tear the agent down mid-command. The
//! coordinator closes the client's stream with a successful terminal frame
//! and forwards the job to a sidecar on the same host, which runs the
//! compose command against the agent's stack directory and restarts it.
//!
//! Note the ordering: the client is told the operation succeeded before the
//! sidecar has confirmed anything. Sidecar failures are logged only; there
//! is no stream left to report them on.

use crate::broadcast::{Broadcaster, OperationMessage};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

const SIDECAR_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SelfUpdateError {
    #[error("failed to build sidecar client: {0}")]
    Client(reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct SelfUpdateConfig {
    /// Base URL of the sidecar, e.g. `https://127.0.0.1:8443`.
    pub endpoint: String,
    /// Bearer credential, identical to the agent's own access token.
    pub token: String,
    /// Skip certificate verification for the intra-host loopback hop.
    pub insecure_tls: bool,
    /// Delay between closing the client stream and contacting the sidecar.
    pub settle_delay: Duration,
}

impl SelfUpdateConfig {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            insecure_tls: true,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Body of the sidecar `POST /operation` call.
#[derive(Debug, Serialize)]
pub struct SidecarOperation {
    pub command: String,
    pub options: Vec<String>,
    pub services: Vec<String>,
    pub stack_path: String,
}

#[derive(Debug, Clone)]
pub struct SelfUpdateCoordinator {
    config: SelfUpdateConfig,
    client: reqwest::Client,
}

impl SelfUpdateCoordinator {
    pub fn new(config: SelfUpdateConfig) -> Result<Self, SelfUpdateError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .timeout(SIDECAR_TIMEOUT)
            .build()
            .map_err(SelfUpdateError::Client)?;
        Ok(Self { config, client })
    }

    /// Hand the operation off to the sidecar.
    ///
    /// Announces the handoff on the broadcaster, terminates the stream with
    /// `complete(success=true, 0)`, and schedules the detached sidecar call
    /// after the settle delay. Returns as soon as the stream is closed; the
    /// caller releases the stack's active-set entry before the sidecar ever
    /// runs.
    pub fn handoff(
        &self,
        command: &str,
        options: &[String],
        services: &[String],
        stack_path: &Path,
        broadcaster: &Broadcaster,
    ) {
        broadcaster.broadcast(OperationMessage::stdout(
            "Operation targets the agent itself; handing off to the update sidecar",
        ));
        broadcaster.broadcast(OperationMessage::stdout(format!(
            "Sidecar will run: compose {command} for {}",
            stack_path.display()
        )));
        broadcaster.broadcast(OperationMessage::stdout(
            "The agent will be restarted by the sidecar; this stream now closes",
        ));
        broadcaster.broadcast_complete(true, 0);

        let body = SidecarOperation {
            command: command.to_string(),
            options: options.to_vec(),
            services: services.to_vec(),
            stack_path: stack_path.display().to_string(),
        };
        let client = self.client.clone();
        let url = format!(
            "{}/operation",
            self.config.endpoint.trim_end_matches('/')
        );
        let token = self.config.token.clone();
        let settle = self.config.settle_delay;

        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            info!(%url, command = %body.command, "forwarding self-operation to sidecar");
            let result = client
                .post(&url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    info!("sidecar accepted self-operation");
                }
                Ok(response) => {
                    let status = response.status();
                    let detail = response.text().await.unwrap_or_default();
                    error!(%status, detail, "sidecar rejected self-operation");
                }
                Err(e) => {
                    error!("sidecar call failed: {e}");
                }
            }
        });
    }
}
