use crate::audit::AuditLogger;
use crate::config::Config;
use crate::hub::StatusHub;
use berth_core::registry::OperationRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: OperationRegistry,
    pub hub: Arc<StatusHub>,
    pub audit: Arc<AuditLogger>,
    /// Root cancellation: cancelled on shutdown, parent of every
    /// per-request token.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("port", &self.config.port)
            .field("stack_location", &self.config.stack_location)
            .finish()
    }
}
