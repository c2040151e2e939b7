//! Operation lifecycle endpoints: start, stream, status.

use crate::audit::AuditRecord;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use axum::{
    Json,
    extract::{ConnectInfo, Path, State},
    http::header,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use berth_core::registry::OperationView;
use berth_core::validate::OperationRequest;
use futures_util::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct StartOperationResponse {
    #[serde(rename = "operationId")]
    pub operation_id: String,
}

/// `POST /api/stacks/{name}/operations`
pub async fn start_operation_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<OperationRequest>,
) -> AppResult<Json<StartOperationResponse>> {
    let command = request.command.clone();

    match state.registry.start_operation(&name, request) {
        Ok(operation_id) => {
            let mut record = AuditRecord::new("operation_started");
            record.client_ip = Some(addr.ip().to_string());
            record.stack_name = Some(name);
            record.operation_id = Some(operation_id.clone());
            record.command = Some(command);
            state.audit.record(record);

            Ok(Json(StartOperationResponse { operation_id }))
        }
        Err(err) => {
            let mut record = AuditRecord::new("operation_rejected");
            record.client_ip = Some(addr.ip().to_string());
            record.stack_name = Some(name);
            record.command = Some(command);
            record.success = Some(false);
            record.failure_reason = Some(err.to_string());
            state.audit.record(record);

            Err(err.into())
        }
    }
}

/// `GET /api/operations/{id}/stream`
///
/// Server-sent events; each frame is `data: <json>\n\n`. The first
/// subscriber starts the operation. Dropping the connection cancels the
/// per-request token, which signals the engine child; the operation still
/// records its terminal frame for any remaining or future subscriber.
pub async fn stream_operation_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    if state.registry.get_operation(&id).is_none() {
        return Err(AppError::not_found(format!("unknown operation: {id}"))
            .with_code("operation-not-found"));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = state.shutdown.child_token();

    {
        let registry = state.registry.clone();
        let id = id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = registry
                .stream_operation(&id, Uuid::new_v4(), tx, cancel)
                .await
            {
                warn!(operation = %id, "stream driver failed: {e}");
            }
        });
    }

    let stream = message_stream(rx, cancel);
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

fn message_stream(
    mut rx: mpsc::UnboundedReceiver<berth_core::broadcast::OperationMessage>,
    cancel: tokio_util::sync::CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // Dropped with the stream when the client disconnects, cancelling
        // the per-request token.
        let _guard = cancel.drop_guard();
        while let Some(message) = rx.recv().await {
            let terminal = message.is_terminal();
            match serde_json::to_string(&message) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => debug!("failed to encode operation message: {e}"),
            }
            if terminal {
                break;
            }
        }
    }
}

/// `GET /api/operations/{id}/status`
pub async fn operation_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<OperationView>> {
    state
        .registry
        .get_operation(&id)
        .map(Json)
        .ok_or_else(|| {
            AppError::not_found(format!("unknown operation: {id}")).with_code("operation-not-found")
        })
}
