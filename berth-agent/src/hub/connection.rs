use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound queue depth per status subscriber. A client that cannot drain
/// this many frames is evicted rather than allowed to stall the hub.
pub const CLIENT_QUEUE_DEPTH: usize = 64;

/// One connected status subscriber.
#[derive(Debug)]
pub struct StatusClient {
    pub id: Uuid,
    sender: mpsc::Sender<String>,
}

impl StatusClient {
    /// Create a client and the receiving half its websocket write loop
    /// drains.
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn try_send(&self, payload: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.sender.try_send(payload)
    }
}
