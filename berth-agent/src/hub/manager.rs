use super::connection::StatusClient;
use berth_core::events::StatusEvent;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fan-out hub for container and stack status events.
///
/// Every registered client receives every broadcast; there is no per-client
/// filtering. A client whose outbound queue is full is evicted, which
/// closes its websocket write loop.
pub struct StatusHub {
    clients: DashMap<Uuid, StatusClient>,
}

impl fmt::Debug for StatusHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusHub")
            .field("client_count", &self.clients.len())
            .finish()
    }
}

impl StatusHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
        })
    }

    pub fn register(&self, client: StatusClient) {
        debug!(client = %client.id, "status subscriber registered");
        self.clients.insert(client.id, client);
    }

    pub fn deregister(&self, id: Uuid) {
        if self.clients.remove(&id).is_some() {
            debug!(client = %id, "status subscriber deregistered");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Send `payload` to every client. Clients that are full or gone are
    /// removed after the iteration to avoid holding shard locks while
    /// mutating.
    pub fn broadcast(&self, payload: &str) {
        let mut evicted = Vec::new();
        for entry in self.clients.iter() {
            if let Err(e) = entry.value().try_send(payload.to_string()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(client = %entry.key(), "status subscriber too slow, evicting");
                    }
                    mpsc::error::TrySendError::Closed(_) => {}
                }
                evicted.push(*entry.key());
            }
        }
        for id in evicted {
            self.deregister(id);
        }
    }

    /// Drain translated engine events into the hub until shutdown.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<StatusEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = cancel.cancelled() => break,
                };
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(payload) => hub.broadcast(&payload),
                    Err(e) => warn!("failed to encode status event: {e}"),
                }
            }
            info!("status event pump stopped");
        })
    }
}
