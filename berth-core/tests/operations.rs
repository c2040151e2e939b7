//! End-to-end operation lifecycle tests driving the registry with a stub
//! engine binary.

use berth_core::broadcast::OperationMessage;
use berth_core::registry::{OperationRegistry, OperationStatus, RegistryConfig, RegistryError};
use berth_core::runner::CommandRunner;
use berth_core::selfupdate::{SelfUpdateConfig, SelfUpdateCoordinator};
use berth_core::validate::OperationRequest;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn write_stub_engine(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("docker");
    std::fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn test_registry(stack_root: &Path, engine: &Path) -> OperationRegistry {
    test_registry_with_sidecar(stack_root, engine, "https://127.0.0.1:1")
}

fn test_registry_with_sidecar(
    stack_root: &Path,
    engine: &Path,
    sidecar: &str,
) -> OperationRegistry {
    let mut sidecar_config = SelfUpdateConfig::new(sidecar, "test-token");
    sidecar_config.settle_delay = Duration::from_millis(10);
    OperationRegistry::new(
        RegistryConfig::new(stack_root),
        CommandRunner::new(engine.to_string_lossy().into_owned()),
        SelfUpdateCoordinator::new(sidecar_config).unwrap(),
    )
}

async fn collect_stream(
    registry: &OperationRegistry,
    id: &str,
) -> Result<Vec<OperationMessage>, RegistryError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry
        .stream_operation(id, Uuid::new_v4(), tx, CancellationToken::new())
        .await?;
    let mut messages = Vec::new();
    while let Some(message) = rx.recv().await {
        messages.push(message);
    }
    Ok(messages)
}

#[tokio::test]
async fn traversal_stack_name_is_rejected_before_any_side_effect() {
    let root = tempfile::tempdir().unwrap();
    let engine = write_stub_engine(root.path(), "echo should-never-run\n");
    let registry = test_registry(root.path(), &engine);

    let err = registry
        .start_operation("../escape", OperationRequest::new("up"))
        .unwrap_err();
    assert!(err.to_string().contains("invalid stack"));
}

#[tokio::test]
async fn unknown_stack_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let engine = write_stub_engine(root.path(), "exit 0\n");
    let registry = test_registry(root.path(), &engine);

    let err = registry
        .start_operation("ghost", OperationRequest::new("up"))
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::StackPath(berth_core::StackPathError::NotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_operation_on_same_stack_conflicts() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("web")).unwrap();
    let engine = write_stub_engine(root.path(), "echo up\nsleep 5\n");
    let registry = test_registry(root.path(), &engine);

    let first = registry
        .start_operation("web", OperationRequest::new("up"))
        .unwrap();

    let cancel = CancellationToken::new();
    let driver = {
        let registry = registry.clone();
        let first = first.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry
                .stream_operation(&first, Uuid::new_v4(), tx, cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = registry
        .start_operation("web", OperationRequest::new("up"))
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains(&first), "conflict must name the running id");
    assert!(message.contains("web"), "conflict must name the stack");

    cancel.cancel();
    driver.await.unwrap().unwrap();

    // The slot frees once the first operation terminates.
    assert!(registry.active_operation("web").is_none());
    registry
        .start_operation("web", OperationRequest::new("up"))
        .unwrap();
}

#[tokio::test]
async fn late_subscriber_replays_identical_log_then_ends() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("web")).unwrap();
    let engine = write_stub_engine(root.path(), "echo m1\necho m2\nexit 0\n");
    let registry = test_registry(root.path(), &engine);

    let id = registry
        .start_operation("web", OperationRequest::new("up"))
        .unwrap();

    let live = collect_stream(&registry, &id).await.unwrap();

    // Attach after termination: identical sequence, then end-of-stream.
    let replayed = collect_stream(&registry, &id).await.unwrap();
    assert_eq!(live, replayed);

    let data: Vec<_> = replayed
        .iter()
        .filter_map(|message| match message {
            OperationMessage::Stdout { data, .. } => Some(data.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(data, vec!["m1", "m2"]);
    assert!(matches!(
        replayed.last().unwrap(),
        OperationMessage::Complete {
            success: true,
            exit_code: 0,
            ..
        }
    ));

    let terminal_count = replayed.iter().filter(|m| m.is_terminal()).count();
    assert_eq!(terminal_count, 1);
}

#[tokio::test]
async fn nonzero_exit_maps_to_failed_with_exit_code() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("web")).unwrap();
    let engine = write_stub_engine(root.path(), "echo failing >&2\nexit 3\n");
    let registry = test_registry(root.path(), &engine);

    let id = registry
        .start_operation("web", OperationRequest::new("down"))
        .unwrap();
    let messages = collect_stream(&registry, &id).await.unwrap();

    assert!(matches!(
        messages.last().unwrap(),
        OperationMessage::Complete {
            success: false,
            exit_code: 3,
            ..
        }
    ));

    let view = registry.get_operation(&id).unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
    assert_eq!(view.exit_code, Some(3));
    assert!(registry.active_operation("web").is_none());
}

#[tokio::test]
async fn spawn_failure_surfaces_as_terminal_error() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("web")).unwrap();
    let registry = test_registry(root.path(), Path::new("/nonexistent/berth-engine"));

    let id = registry
        .start_operation("web", OperationRequest::new("up"))
        .unwrap();
    let messages = collect_stream(&registry, &id).await.unwrap();

    assert_eq!(messages.len(), 1);
    assert!(matches!(
        messages.last().unwrap(),
        OperationMessage::Error { .. }
    ));
    assert_eq!(
        registry.get_operation(&id).unwrap().status,
        OperationStatus::Failed
    );
}

#[tokio::test]
async fn stack_wide_operation_on_agent_stack_is_reserved() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("berth-agent")).unwrap();
    let engine = write_stub_engine(root.path(), "exit 0\n");
    let registry = test_registry(root.path(), &engine);

    let err = registry
        .start_operation("berth-agent", OperationRequest::new("down"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::ReservedStack(_)));

    // Targeting a specific non-agent service is fine.
    registry
        .start_operation(
            "berth-agent",
            OperationRequest::new("restart").with_services(["helper"]),
        )
        .unwrap();
}

#[tokio::test]
async fn unknown_operation_stream_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let engine = write_stub_engine(root.path(), "exit 0\n");
    let registry = test_registry(root.path(), &engine);

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = registry
        .stream_operation("no-such-id", Uuid::new_v4(), tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
}

#[tokio::test]
async fn create_archive_operation_produces_archive_and_completes() {
    let root = tempfile::tempdir().unwrap();
    let stack = root.path().join("stk");
    std::fs::create_dir_all(stack.join("data")).unwrap();
    std::fs::write(stack.join("compose.yaml"), "services: {}\n").unwrap();
    std::fs::write(stack.join("data/seed.sql"), "select 1;\n").unwrap();
    let engine = write_stub_engine(root.path(), "exit 0\n");
    let registry = test_registry(root.path(), &engine);

    let id = registry
        .start_operation(
            "stk",
            OperationRequest::new("create-archive").with_options([
                "--format", "tar.gz", "--output", "out.tgz", "--include", ".",
            ]),
        )
        .unwrap();
    let messages = collect_stream(&registry, &id).await.unwrap();

    assert!(matches!(
        messages.last().unwrap(),
        OperationMessage::Complete {
            success: true,
            exit_code: 0,
            ..
        }
    ));
    assert!(stack.join("out.tgz").exists());
    assert_eq!(
        registry.get_operation(&id).unwrap().status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn self_op_hands_off_to_sidecar_and_closes_stream() {
    use axum::{Json, Router, extract::State, routing::post};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured {
        body: Arc<Mutex<Option<serde_json::Value>>>,
    }

    async fn accept(
        State(captured): State<Captured>,
        Json(body): Json<serde_json::Value>,
    ) -> &'static str {
        *captured.body.lock().unwrap() = Some(body);
        "ok"
    }

    let captured = Captured::default();
    let app = Router::new()
        .route("/operation", post(accept))
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("berth-agent")).unwrap();
    let engine = write_stub_engine(root.path(), "echo must-not-run\nexit 9\n");
    let registry =
        test_registry_with_sidecar(root.path(), &engine, &format!("http://{addr}"));

    let id = registry
        .start_operation(
            "berth-agent",
            OperationRequest::new("restart").with_services(["berth-agent"]),
        )
        .unwrap();

    let start = std::time::Instant::now();
    let messages = collect_stream(&registry, &id).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));

    // Stream closes successfully before the sidecar has confirmed anything.
    assert!(matches!(
        messages.last().unwrap(),
        OperationMessage::Complete {
            success: true,
            exit_code: 0,
            ..
        }
    ));
    assert!(registry.active_operation("berth-agent").is_none());

    // The sidecar eventually receives the forwarded job.
    let mut body = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        body = captured.body.lock().unwrap().clone();
        if body.is_some() {
            break;
        }
    }
    let body = body.expect("sidecar was never called");
    let expected_path = root
        .path()
        .canonicalize()
        .unwrap()
        .join("berth-agent")
        .display()
        .to_string();
    assert_eq!(body["command"], "restart");
    assert_eq!(body["options"], serde_json::json!([]));
    assert_eq!(body["services"], serde_json::json!(["berth-agent"]));
    assert_eq!(body["stack_path"], serde_json::Value::String(expected_path));
}
