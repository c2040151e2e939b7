//! Container engine event monitoring.
//!
//! Tails `docker events` filtered to containers, translates engine actions
//! into a normalised per-container model, and schedules a debounced
//! per-stack aggregate recomputation via `compose ps`. Translated events are
//! pushed to a sink channel; the status hub on the other side fans them out
//! to websocket subscribers.

use crate::stack;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RETRY_BACKOFF: Duration = Duration::from_secs(5);
const AGGREGATE_DEBOUNCE: Duration = Duration::from_secs(1);

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Created,
    Restarting,
    Paused,
    NotCreated,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerHealth {
    #[serde(rename = "")]
    None,
    Healthy,
    Unhealthy,
    Starting,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackContainerEvent {
    pub stack_name: String,
    pub service_name: String,
    pub container_name: String,
    pub container_id: String,
    pub status: ContainerStatus,
    pub health: ContainerHealth,
    pub image: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    Down,
    Running,
    Stopped,
    Partial,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackAggregate {
    pub stack_name: String,
    pub services: usize,
    pub running: usize,
    pub stopped: usize,
    pub status: StackStatus,
    pub timestamp: DateTime<Utc>,
}

/// Operation lifecycle notification for status subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationProgressEvent {
    pub operation_id: String,
    pub stack_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Everything published on the status wire, tagged for the websocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    ContainerStatus(StackContainerEvent),
    StackStatus(StackAggregate),
    OperationProgress(OperationProgressEvent),
}

pub type StatusSink = mpsc::UnboundedSender<StatusEvent>;

/// Raw engine event record as decoded from `docker events --format json`.
#[derive(Debug, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor")]
    pub actor: EngineActor,
    #[serde(default, rename = "time")]
    pub time: i64,
}

#[derive(Debug, Deserialize)]
pub struct EngineActor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default, rename = "Attributes")]
    pub attributes: HashMap<String, String>,
}

pub fn action_to_status(action: &str) -> ContainerStatus {
    match action {
        "start" => ContainerStatus::Running,
        "stop" | "die" | "kill" | "oom" => ContainerStatus::Stopped,
        "destroy" => ContainerStatus::NotCreated,
        "create" => ContainerStatus::Created,
        "restart" => ContainerStatus::Restarting,
        "pause" => ContainerStatus::Paused,
        "unpause" => ContainerStatus::Running,
        other if other.starts_with("health_status") => ContainerStatus::Running,
        _ => ContainerStatus::Unknown,
    }
}

pub fn action_to_health(action: &str) -> ContainerHealth {
    match action {
        "health_status: healthy" => ContainerHealth::Healthy,
        "health_status: unhealthy" => ContainerHealth::Unhealthy,
        "health_status: starting" => ContainerHealth::Starting,
        _ => ContainerHealth::None,
    }
}

/// Split a compose container name into `(stack, service)`.
///
/// Compose names containers `<project>-<service>-<index>`; anything with
/// fewer than three segments does not belong to a stack.
pub fn parse_container_name(name: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    let service = parts[parts.len() - 2].to_string();
    let stack = parts[..parts.len() - 2].join("-");
    Some((stack, service))
}

/// Translate a raw engine event into the normalised model.
///
/// Compose project/service labels are authoritative when present; the
/// container-name convention is the fallback.
pub fn translate_event(event: &EngineEvent) -> Option<StackContainerEvent> {
    if event.kind != "container" {
        return None;
    }
    let attributes = &event.actor.attributes;
    let container_name = attributes.get("name").cloned().unwrap_or_default();

    let (stack_name, service_name) = match (
        attributes.get(COMPOSE_PROJECT_LABEL),
        attributes.get(COMPOSE_SERVICE_LABEL),
    ) {
        (Some(project), Some(service)) => (project.clone(), service.clone()),
        _ => parse_container_name(&container_name)?,
    };

    let timestamp = if event.time > 0 {
        DateTime::from_timestamp(event.time, 0).unwrap_or_else(Utc::now)
    } else {
        Utc::now()
    };

    Some(StackContainerEvent {
        stack_name,
        service_name,
        container_name,
        container_id: event.actor.id.clone(),
        status: action_to_status(&event.action),
        health: action_to_health(&event.action),
        image: attributes.get("image").cloned().unwrap_or_default(),
        timestamp,
    })
}

/// One `compose ps --format json` row; the engine emits one object per
/// line on current versions and a single array on older ones.
#[derive(Debug, Deserialize)]
pub struct ComposePsItem {
    #[serde(default, rename = "Service")]
    pub service: String,
    #[serde(default, rename = "State")]
    pub state: String,
}

fn parse_compose_ps(stdout: &str) -> Vec<ComposePsItem> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).unwrap_or_default();
    }
    trimmed
        .lines()
        .filter_map(|line| serde_json::from_str(line.trim()).ok())
        .collect()
}

pub fn aggregate_from_ps(stack_name: &str, items: &[ComposePsItem]) -> StackAggregate {
    let services = items.len();
    let running = items.iter().filter(|item| item.state == "running").count();
    let stopped = services - running;
    let status = if services == 0 {
        StackStatus::Down
    } else if running == services {
        StackStatus::Running
    } else if running == 0 {
        StackStatus::Stopped
    } else {
        StackStatus::Partial
    };
    StackAggregate {
        stack_name: stack_name.to_string(),
        services,
        running,
        stopped,
        status,
        timestamp: Utc::now(),
    }
}

pub struct EventMonitor {
    docker_bin: String,
    stack_root: PathBuf,
    sink: StatusSink,
    cancel: CancellationToken,
    debounce: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for EventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMonitor")
            .field("docker_bin", &self.docker_bin)
            .field("stack_root", &self.stack_root)
            .finish()
    }
}

impl EventMonitor {
    pub fn new(
        docker_bin: impl Into<String>,
        stack_root: impl Into<PathBuf>,
        sink: StatusSink,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            docker_bin: docker_bin.into(),
            stack_root: stack_root.into(),
            sink,
            cancel,
            debounce: Mutex::new(HashMap::new()),
        })
    }

    /// Tail the engine event stream until the root context is cancelled,
    /// retrying after a fixed backoff on stream errors.
    pub async fn run(self: Arc<Self>) {
        info!("event monitor started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.tail_events().await {
                Ok(()) => debug!("engine event stream ended"),
                Err(e) => warn!("engine event stream failed: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        info!("event monitor stopped");
    }

    async fn tail_events(self: &Arc<Self>) -> std::io::Result<()> {
        let mut child = Command::new(&self.docker_bin)
            .arg("events")
            .arg("--format")
            .arg("{{json .}}")
            .arg("--filter")
            .arg("type=container")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return Err(std::io::Error::other("engine events stdout was not piped"));
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = self.cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Ok(());
                }
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EngineEvent>(&line) {
                Ok(event) => self.handle_event(&event),
                Err(e) => debug!("undecodable engine event: {e}"),
            }
        }

        let _ = child.wait().await;
        Ok(())
    }

    fn handle_event(self: &Arc<Self>, event: &EngineEvent) {
        let Some(translated) = translate_event(event) else {
            return;
        };
        let stack_name = translated.stack_name.clone();
        if self
            .sink
            .send(StatusEvent::ContainerStatus(translated))
            .is_err()
        {
            return;
        }
        self.schedule_aggregate(stack_name);
    }

    /// Debounce aggregate recomputation: a new event for the same stack
    /// resets the pending timer.
    fn schedule_aggregate(self: &Arc<Self>, stack_name: String) {
        let mut pending = self.debounce.lock();
        if let Some(previous) = pending.remove(&stack_name) {
            previous.abort();
        }
        let monitor = self.clone();
        let key = stack_name.clone();
        pending.insert(
            key,
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(AGGREGATE_DEBOUNCE) => {}
                    _ = monitor.cancel.cancelled() => return,
                }
                match monitor.compute_aggregate(&stack_name).await {
                    Ok(Some(aggregate)) => {
                        let _ = monitor.sink.send(StatusEvent::StackStatus(aggregate));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(stack = %stack_name, "stack aggregate failed: {e}"),
                }
            }),
        );
    }

    /// Recompute a stack's aggregate from `compose ps`. Returns `None` for
    /// container names that do not map to a managed stack directory.
    async fn compute_aggregate(
        &self,
        stack_name: &str,
    ) -> anyhow::Result<Option<StackAggregate>> {
        let stack_dir = match stack::resolve_stack(&self.stack_root, stack_name) {
            Ok(dir) => dir,
            Err(_) => return Ok(None),
        };

        let output = Command::new(&self.docker_bin)
            .arg("compose")
            .arg("ps")
            .arg("--format")
            .arg("json")
            .current_dir(&stack_dir)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "compose ps exited with {}",
                output.status.code().unwrap_or(-1)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let items = parse_compose_ps(&stdout);
        Ok(Some(aggregate_from_ps(stack_name, &items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_event(action: &str, name: &str) -> EngineEvent {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), name.to_string());
        EngineEvent {
            kind: "container".to_string(),
            action: action.to_string(),
            actor: EngineActor {
                id: "abc123".to_string(),
                attributes,
            },
            time: 1_700_000_000,
        }
    }

    #[test]
    fn start_event_translates_to_running() {
        let event = engine_event("start", "web-api-1");
        let translated = translate_event(&event).unwrap();
        assert_eq!(translated.stack_name, "web");
        assert_eq!(translated.service_name, "api");
        assert_eq!(translated.status, ContainerStatus::Running);
        assert_eq!(translated.health, ContainerHealth::None);

        let json = serde_json::to_string(&StatusEvent::ContainerStatus(translated)).unwrap();
        assert!(json.contains(r#""type":"container_status""#));
        assert!(json.contains(r#""stackName":"web""#));
        assert!(json.contains(r#""serviceName":"api""#));
        assert!(json.contains(r#""status":"running""#));
    }

    #[test]
    fn action_mapping() {
        assert_eq!(action_to_status("stop"), ContainerStatus::Stopped);
        assert_eq!(action_to_status("die"), ContainerStatus::Stopped);
        assert_eq!(action_to_status("kill"), ContainerStatus::Stopped);
        assert_eq!(action_to_status("oom"), ContainerStatus::Stopped);
        assert_eq!(action_to_status("destroy"), ContainerStatus::NotCreated);
        assert_eq!(action_to_status("create"), ContainerStatus::Created);
        assert_eq!(action_to_status("restart"), ContainerStatus::Restarting);
        assert_eq!(action_to_status("pause"), ContainerStatus::Paused);
        assert_eq!(action_to_status("unpause"), ContainerStatus::Running);
        assert_eq!(
            action_to_status("health_status: healthy"),
            ContainerStatus::Running
        );
        assert_eq!(action_to_status("exec_create"), ContainerStatus::Unknown);
    }

    #[test]
    fn health_mapping() {
        assert_eq!(
            action_to_health("health_status: healthy"),
            ContainerHealth::Healthy
        );
        assert_eq!(
            action_to_health("health_status: unhealthy"),
            ContainerHealth::Unhealthy
        );
        assert_eq!(
            action_to_health("health_status: starting"),
            ContainerHealth::Starting
        );
        assert_eq!(action_to_health("start"), ContainerHealth::None);
    }

    #[test]
    fn short_names_are_dropped() {
        assert!(parse_container_name("standalone").is_none());
        assert!(parse_container_name("two-parts").is_none());
        assert_eq!(
            parse_container_name("my-stack-db-1"),
            Some(("my-stack".to_string(), "db".to_string()))
        );
    }

    #[test]
    fn labels_win_over_name_parse() {
        let mut event = engine_event("start", "oddly_named_container");
        event
            .actor
            .attributes
            .insert(COMPOSE_PROJECT_LABEL.to_string(), "web".to_string());
        event
            .actor
            .attributes
            .insert(COMPOSE_SERVICE_LABEL.to_string(), "api".to_string());

        let translated = translate_event(&event).unwrap();
        assert_eq!(translated.stack_name, "web");
        assert_eq!(translated.service_name, "api");
    }

    #[test]
    fn non_container_events_are_dropped() {
        let mut event = engine_event("start", "web-api-1");
        event.kind = "network".to_string();
        assert!(translate_event(&event).is_none());
    }

    #[test]
    fn aggregate_statuses() {
        fn items(states: &[&str]) -> Vec<ComposePsItem> {
            states
                .iter()
                .enumerate()
                .map(|(i, state)| ComposePsItem {
                    service: format!("svc{i}"),
                    state: state.to_string(),
                })
                .collect()
        }

        assert_eq!(aggregate_from_ps("s", &items(&[])).status, StackStatus::Down);
        assert_eq!(
            aggregate_from_ps("s", &items(&["running", "running"])).status,
            StackStatus::Running
        );
        assert_eq!(
            aggregate_from_ps("s", &items(&["exited", "exited"])).status,
            StackStatus::Stopped
        );
        let aggregate = aggregate_from_ps("s", &items(&["running", "exited"]));
        assert_eq!(aggregate.status, StackStatus::Partial);
        assert_eq!(aggregate.services, 2);
        assert_eq!(aggregate.running, 1);
        assert_eq!(aggregate.stopped, 1);
    }

    #[test]
    fn compose_ps_accepts_both_wire_shapes() {
        let ndjson = "{\"Service\":\"web\",\"State\":\"running\"}\n{\"Service\":\"db\",\"State\":\"exited\"}\n";
        assert_eq!(parse_compose_ps(ndjson).len(), 2);

        let array = "[{\"Service\":\"web\",\"State\":\"running\"}]";
        assert_eq!(parse_compose_ps(array).len(), 1);

        assert!(parse_compose_ps("").is_empty());
    }
}
