//! Operation registry and lifecycle.
//!
//! Catalogues operations by id, enforces one-active-operation-per-stack,
//! and drives execution: the first stream subscriber dispatches the job to
//! the command runner, the archive engine, or the self-update coordinator.
//! Operations are retained in memory after completion for status queries
//! and late replays, then evicted by the retention sweep.

use crate::archive::{self, ArchiveError, CreateOptions, ExtractOptions};
use crate::broadcast::{Broadcaster, MessageSink, OperationMessage};
use crate::runner::CommandRunner;
use crate::selfupdate::SelfUpdateCoordinator;
use crate::stack::{self, StackPathError};
use crate::validate::{self, OperationRequest, OperationVerb, ValidationError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    StackPath(#[from] StackPathError),

    #[error("stack-wide operations on {0:?} are not permitted; target a specific service")]
    ReservedStack(String),

    #[error("operation {operation_id} is already running on stack {stack_name}")]
    Conflict {
        stack_name: String,
        operation_id: String,
    },

    #[error("unknown operation: {0}")]
    NotFound(String),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::StackPath(e) => e.code(),
            Self::ReservedStack(_) => "reserved-stack",
            Self::Conflict { .. } => "operation-conflict",
            Self::NotFound(_) => "operation-not-found",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug)]
struct OperationState {
    status: OperationStatus,
    exit_code: Option<i64>,
    completed_at: Option<DateTime<Utc>>,
}

/// One invocation of a compose verb or archive action, scoped to a stack.
#[derive(Debug)]
pub struct Operation {
    pub id: String,
    pub stack_name: String,
    pub verb: OperationVerb,
    pub request: OperationRequest,
    pub stack_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub is_self_op: bool,
    pub broadcaster: Arc<Broadcaster>,
    state: Mutex<OperationState>,
}

impl Operation {
    pub fn status(&self) -> OperationStatus {
        self.state.lock().status
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.state.lock().exit_code
    }

    fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().completed_at
    }

    fn finish(&self, status: OperationStatus, exit_code: Option<i64>) {
        let mut state = self.state.lock();
        state.status = status;
        state.exit_code = exit_code;
        state.completed_at = Some(Utc::now());
    }

    pub fn view(&self) -> OperationView {
        let state = self.state.lock();
        OperationView {
            id: self.id.clone(),
            stack_name: self.stack_name.clone(),
            status: state.status,
            exit_code: state.exit_code,
            started_at: self.started_at,
        }
    }
}

/// Snapshot of an operation without its broadcaster log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationView {
    pub id: String,
    pub stack_name: String,
    pub status: OperationStatus,
    pub exit_code: Option<i64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub stack_root: PathBuf,
    /// The stack the agent itself runs in; operations against it are
    /// restricted and may trigger the self-update handoff.
    pub agent_stack_name: String,
    /// How long completed operations stay queryable.
    pub retention: Duration,
}

impl RegistryConfig {
    pub fn new(stack_root: impl Into<PathBuf>) -> Self {
        Self {
            stack_root: stack_root.into(),
            agent_stack_name: "berth-agent".to_string(),
            retention: Duration::from_secs(3600),
        }
    }
}

struct Inner {
    operations: HashMap<String, Arc<Operation>>,
    active: HashMap<String, String>,
}

type CompletionHook = Arc<dyn Fn(OperationView) + Send + Sync>;

#[derive(Clone)]
pub struct OperationRegistry {
    config: Arc<RegistryConfig>,
    runner: Arc<CommandRunner>,
    self_update: Arc<SelfUpdateCoordinator>,
    inner: Arc<RwLock<Inner>>,
    on_complete: Option<CompletionHook>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("OperationRegistry")
            .field("operations", &inner.operations.len())
            .field("active", &inner.active.len())
            .finish()
    }
}

impl OperationRegistry {
    pub fn new(
        config: RegistryConfig,
        runner: CommandRunner,
        self_update: SelfUpdateCoordinator,
    ) -> Self {
        Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
            self_update: Arc::new(self_update),
            inner: Arc::new(RwLock::new(Inner {
                operations: HashMap::new(),
                active: HashMap::new(),
            })),
            on_complete: None,
        }
    }

    /// Install a hook invoked once per operation after its terminal frame,
    /// e.g. for audit logging.
    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    /// Validate and register a new operation. Returns its id; execution
    /// starts when the first stream subscriber attaches.
    pub fn start_operation(
        &self,
        stack_name: &str,
        request: OperationRequest,
    ) -> Result<String, RegistryError> {
        let verb = validate::validate_request(&request)?;
        let stack_dir = stack::resolve_stack(&self.config.stack_root, stack_name)?;

        // The agent will not tear down its own stack in one action.
        if stack_name == self.config.agent_stack_name && request.services.is_empty() {
            return Err(RegistryError::ReservedStack(stack_name.to_string()));
        }

        let is_self_op = stack_name == self.config.agent_stack_name
            && matches!(verb, OperationVerb::Up | OperationVerb::Restart)
            && request.services.len() == 1
            && request.services[0] == self.config.agent_stack_name;

        let mut inner = self.inner.write();
        if let Some(existing) = inner.active.get(stack_name) {
            return Err(RegistryError::Conflict {
                stack_name: stack_name.to_string(),
                operation_id: existing.clone(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let operation = Arc::new(Operation {
            id: id.clone(),
            stack_name: stack_name.to_string(),
            verb,
            request,
            stack_dir,
            started_at: Utc::now(),
            is_self_op,
            broadcaster: Arc::new(Broadcaster::new()),
            state: Mutex::new(OperationState {
                status: OperationStatus::Running,
                exit_code: None,
                completed_at: None,
            }),
        });

        inner.active.insert(stack_name.to_string(), id.clone());
        inner.operations.insert(id.clone(), operation);
        info!(operation = %id, stack = %stack_name, verb = %verb, "operation registered");
        Ok(id)
    }

    pub fn get_operation(&self, id: &str) -> Option<OperationView> {
        self.inner.read().operations.get(id).map(|op| op.view())
    }

    /// Currently active operation id for a stack, if any.
    pub fn active_operation(&self, stack_name: &str) -> Option<String> {
        self.inner.read().active.get(stack_name).cloned()
    }

    fn operation(&self, id: &str) -> Option<Arc<Operation>> {
        self.inner.read().operations.get(id).cloned()
    }

    /// Attach a subscriber to an operation's stream.
    ///
    /// The first subscriber drives execution and the call returns when the
    /// operation reaches its terminal frame. Later subscribers replay the
    /// log and block until completion or their own cancellation. Either way
    /// the sink has received the full log, terminal frame included, by the
    /// time this returns `Ok`.
    pub async fn stream_operation(
        &self,
        id: &str,
        subscriber_id: Uuid,
        sink: MessageSink,
        cancel: CancellationToken,
    ) -> Result<(), RegistryError> {
        let operation = self
            .operation(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        operation.broadcaster.subscribe(subscriber_id, sink);

        if !operation.broadcaster.mark_started() {
            tokio::select! {
                _ = operation.broadcaster.wait_completed() => {}
                _ = cancel.cancelled() => {}
            }
            operation.broadcaster.unsubscribe(subscriber_id);
            return Ok(());
        }

        // First subscriber: run the job on its own task so a panic cannot
        // leak the active-set entry.
        let driver = {
            let registry = self.clone();
            let operation = operation.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.execute(&operation, cancel).await })
        };

        let (status, exit_code) = match driver.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(operation = %operation.id, "operation driver panicked: {join_error}");
                operation
                    .broadcaster
                    .broadcast_error("operation terminated unexpectedly");
                (OperationStatus::Failed, None)
            }
        };

        operation.finish(status, exit_code);
        self.release_active(&operation.stack_name, &operation.id);
        operation.broadcaster.unsubscribe(subscriber_id);

        if let Some(hook) = &self.on_complete {
            hook(operation.view());
        }

        info!(
            operation = %operation.id,
            stack = %operation.stack_name,
            ?status,
            "operation finished"
        );
        Ok(())
    }

    /// Remove the active-set entry iff it still points at this operation.
    fn release_active(&self, stack_name: &str, id: &str) {
        let mut inner = self.inner.write();
        if inner.active.get(stack_name).map(String::as_str) == Some(id) {
            inner.active.remove(stack_name);
        }
    }

    /// Run the operation to its terminal frame. Exactly one terminal frame
    /// is emitted on every path out of this function.
    async fn execute(
        &self,
        operation: &Arc<Operation>,
        cancel: CancellationToken,
    ) -> (OperationStatus, Option<i64>) {
        if operation.is_self_op {
            self.self_update.handoff(
                operation.verb.as_str(),
                &operation.request.options,
                &operation.request.services,
                &operation.stack_dir,
                &operation.broadcaster,
            );
            return (OperationStatus::Completed, Some(0));
        }

        if operation.verb.is_archive() {
            return self.execute_archive(operation, cancel).await;
        }

        match self
            .runner
            .run(
                operation.verb,
                &operation.request.options,
                &operation.request.services,
                &operation.stack_dir,
                &operation.request.credentials,
                operation.broadcaster.clone(),
                cancel,
            )
            .await
        {
            Ok(code) => {
                operation.broadcaster.broadcast_complete(code == 0, code);
                let status = if code == 0 {
                    OperationStatus::Completed
                } else {
                    OperationStatus::Failed
                };
                (status, Some(code))
            }
            Err(e) => {
                warn!(operation = %operation.id, "engine command failed: {e}");
                operation.broadcaster.broadcast_error(e.to_string());
                (OperationStatus::Failed, None)
            }
        }
    }

    async fn execute_archive(
        &self,
        operation: &Arc<Operation>,
        cancel: CancellationToken,
    ) -> (OperationStatus, Option<i64>) {
        let broadcaster = operation.broadcaster.clone();
        let stack_dir = operation.stack_dir.clone();
        let options = operation.request.options.clone();
        let verb = operation.verb;

        let task = tokio::task::spawn_blocking(move || match verb {
            OperationVerb::CreateArchive => {
                let opts = CreateOptions::parse(&options)?;
                let count = archive::create_archive(&stack_dir, &opts, &broadcaster, &cancel)?;
                Ok::<u64, ArchiveError>(count)
            }
            OperationVerb::ExtractArchive => {
                let opts = ExtractOptions::parse(&options)?;
                let count = archive::extract_archive(&stack_dir, &opts, &broadcaster, &cancel)?;
                Ok(count)
            }
            _ => unreachable!("execute_archive called for non-archive verb"),
        });

        match task.await {
            Ok(Ok(count)) => {
                operation
                    .broadcaster
                    .broadcast(OperationMessage::stdout(format!(
                        "processed {count} entries"
                    )));
                operation.broadcaster.broadcast_complete(true, 0);
                (OperationStatus::Completed, Some(0))
            }
            Ok(Err(ArchiveError::Cancelled)) => {
                operation.broadcaster.broadcast_error("operation cancelled");
                (OperationStatus::Failed, None)
            }
            Ok(Err(e)) => {
                operation.broadcaster.broadcast_error(e.to_string());
                (OperationStatus::Failed, None)
            }
            Err(join_error) => {
                error!(operation = %operation.id, "archive task panicked: {join_error}");
                operation
                    .broadcaster
                    .broadcast_error("archive task terminated unexpectedly");
                (OperationStatus::Failed, None)
            }
        }
    }

    /// Periodically evict completed operations past the retention window.
    pub fn spawn_retention_sweep(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                registry.evict_expired();
            }
        })
    }

    fn evict_expired(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.config.retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        let mut inner = self.inner.write();
        let before = inner.operations.len();
        inner
            .operations
            .retain(|_, op| match op.completed_at() {
                Some(completed_at) => completed_at > cutoff,
                None => true,
            });
        let evicted = before - inner.operations.len();
        if evicted > 0 {
            info!(evicted, "evicted completed operations past retention");
        }
    }
}
