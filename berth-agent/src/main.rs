//! # Berth Agent
//!
//! Per-host control-plane agent managing Docker Compose stacks on behalf of
//! a remote orchestrator.
//!
//! ## Overview
//!
//! - **Operations**: compose verbs and stack archives, streamed to any
//!   number of subscribers over SSE with full replay
//! - **Self-update**: operations targeting the agent's own stack are handed
//!   off to a sidecar so the agent can be restarted by its own command
//! - **Status**: the container engine's event stream is normalised and
//!   fanned out to websocket subscribers, with debounced per-stack
//!   aggregates
//!
//! The framework-agnostic core lives in `berth-core`; this crate wires it
//! to axum, configuration, audit logging, and TLS.

pub mod audit;
pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod hub;
pub mod routes;
pub mod state;
pub mod tls;

use crate::audit::{AuditLogger, AuditRecord};
use crate::config::Config;
use crate::hub::StatusHub;
use crate::state::AppState;
use berth_core::events::{EventMonitor, OperationProgressEvent, StatusEvent};
use berth_core::registry::{OperationRegistry, OperationStatus, RegistryConfig};
use berth_core::runner::CommandRunner;
use berth_core::selfupdate::{SelfUpdateConfig, SelfUpdateCoordinator};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Process-wide crypto provider for both the listener and the sidecar
    // client. Installing twice is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Arc::new(Config::load());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berth_agent=info,berth_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Stack location: {}", config.stack_location.display());
    if config.access_token.is_none() {
        warn!("No ACCESS_TOKEN configured - all authenticated endpoints will refuse requests");
    }
    if !config.stack_location.exists() {
        warn!(
            "Stack location {} does not exist; operations will fail until it is created",
            config.stack_location.display()
        );
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let audit = Arc::new(if config.audit_log_enabled {
        AuditLogger::new(config.audit_log_file_path.clone())
    } else {
        AuditLogger::disabled()
    });

    let mut sidecar_config = SelfUpdateConfig::new(
        config.sidecar_url.clone(),
        config.access_token.clone().unwrap_or_default(),
    );
    sidecar_config.insecure_tls = config.sidecar_insecure_tls;
    let self_update = SelfUpdateCoordinator::new(sidecar_config)?;

    let mut registry_config = RegistryConfig::new(config.stack_location.clone());
    registry_config.retention = config.operation_retention;
    let registry = OperationRegistry::new(
        registry_config,
        CommandRunner::new(config.docker_bin.clone()),
        self_update,
    );
    let hub = StatusHub::new();
    let (status_tx, status_rx) = mpsc::unbounded_channel();

    let registry = registry.with_completion_hook({
        let audit = audit.clone();
        let status_tx = status_tx.clone();
        Arc::new(move |view| {
            let succeeded = view.status == OperationStatus::Completed;

            let mut record = AuditRecord::new("operation_completed");
            record.stack_name = Some(view.stack_name.clone());
            record.operation_id = Some(view.id.clone());
            record.success = Some(succeeded);
            record.duration_ms = Some((Utc::now() - view.started_at).num_milliseconds());
            audit.record(record);

            let _ = status_tx.send(StatusEvent::OperationProgress(OperationProgressEvent {
                operation_id: view.id,
                stack_name: view.stack_name,
                status: if succeeded { "completed" } else { "failed" }.to_string(),
                exit_code: view.exit_code,
                timestamp: Utc::now(),
            }));
        })
    });
    let _retention_sweep = registry.spawn_retention_sweep(shutdown.clone());
    let _event_pump = hub.spawn_event_pump(status_rx, shutdown.clone());
    let monitor = EventMonitor::new(
        config.docker_bin.clone(),
        config.stack_location.clone(),
        status_tx,
        shutdown.clone(),
    );
    let _event_monitor = tokio::spawn(monitor.run());

    let state = AppState {
        config: config.clone(),
        registry,
        hub,
        audit,
        shutdown: shutdown.clone(),
    };

    let app = routes::create_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let handle = axum_server::Handle::new();

    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("shutting down HTTP listener");
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        });
    }

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!("TLS enabled - starting HTTPS server on {addr}");
            let rustls_config = tls::load_rustls_config(cert_path, key_path).await?;
            axum_server::bind_rustls(addr, rustls_config)
                .handle(handle)
                .serve(make_service)
                .await?;
        }
        _ => {
            info!("Starting HTTP server on {addr}");
            warn!("TLS is not configured. Set TLS_CERT_PATH and TLS_KEY_PATH for production use.");
            axum_server::bind(addr)
                .handle(handle)
                .serve(make_service)
                .await?;
        }
    }

    info!("agent stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => error!("failed to listen for SIGTERM: {e}"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = terminate => info!("received SIGTERM"),
        }
        shutdown.cancel();
    });
}
