//! Per-operation pub/sub with full replay.
//!
//! Every operation owns one [`Broadcaster`]. Output lines, progress notes,
//! and the single terminal frame are appended to an ordered log and fanned
//! out to all current subscribers under the same mutex, so a subscriber can
//! never observe a message that is not also in the log. Late subscribers
//! receive the entire log on attach, in original order, before any new
//! message. Sinks are unbounded senders; a sink whose receiver is gone is
//! silently dropped from the subscriber set.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// A single frame of operation output.
///
/// `Complete` and `Error` are terminal; exactly one of them ever appears in
/// a broadcaster's log, always as the last entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationMessage {
    Stdout {
        data: String,
        timestamp: DateTime<Utc>,
    },
    Stderr {
        data: String,
        timestamp: DateTime<Utc>,
    },
    Progress {
        data: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        data: String,
        timestamp: DateTime<Utc>,
    },
    Complete {
        success: bool,
        #[serde(rename = "exitCode")]
        exit_code: i64,
        timestamp: DateTime<Utc>,
    },
}

impl OperationMessage {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn progress(data: impl Into<String>) -> Self {
        Self::Progress {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Where subscribers receive frames. Unbounded so that replay and fan-out
/// can happen under the broadcaster mutex without blocking.
pub type MessageSink = mpsc::UnboundedSender<OperationMessage>;

struct Subscriber {
    id: Uuid,
    sink: MessageSink,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    log: Vec<OperationMessage>,
    started: bool,
    completed: bool,
}

pub struct Broadcaster {
    inner: Mutex<Inner>,
    completed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Broadcaster")
            .field("subscribers", &inner.subscribers.len())
            .field("log_len", &inner.log.len())
            .field("started", &inner.started)
            .field("completed", &inner.completed)
            .finish()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (completed_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                log: Vec::new(),
                started: false,
                completed: false,
            }),
            completed_tx,
        }
    }

    /// Attach a subscriber and replay the entire log to it.
    ///
    /// Attaching after completion is legal and yields the full log including
    /// the terminal frame.
    pub fn subscribe(&self, id: Uuid, sink: MessageSink) {
        let mut inner = self.inner.lock();
        for message in &inner.log {
            // A receiver dropped mid-replay just stops receiving; the stale
            // subscriber entry is pruned on the next broadcast.
            let _ = sink.send(message.clone());
        }
        inner.subscribers.push(Subscriber { id, sink });
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|sub| sub.id != id);
    }

    /// Append a non-terminal message and fan it out. No-op once completed.
    pub fn broadcast(&self, message: OperationMessage) {
        debug_assert!(!message.is_terminal(), "terminal frames go through broadcast_complete/broadcast_error");
        let mut inner = self.inner.lock();
        if inner.completed {
            return;
        }
        inner.log.push(message.clone());
        inner
            .subscribers
            .retain(|sub| sub.sink.send(message.clone()).is_ok());
    }

    /// Emit the terminal completion frame. Idempotent: only the first
    /// terminal call (complete or error) takes effect.
    pub fn broadcast_complete(&self, success: bool, exit_code: i64) {
        self.finish(OperationMessage::Complete {
            success,
            exit_code,
            timestamp: Utc::now(),
        });
    }

    /// Emit a terminal error frame. Mutually exclusive with
    /// [`broadcast_complete`](Self::broadcast_complete); whichever lands
    /// first wins.
    pub fn broadcast_error(&self, message: impl Into<String>) {
        self.finish(OperationMessage::Error {
            data: message.into(),
            timestamp: Utc::now(),
        });
    }

    fn finish(&self, message: OperationMessage) {
        {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            inner.completed = true;
            inner.log.push(message.clone());
            inner
                .subscribers
                .retain(|sub| sub.sink.send(message.clone()).is_ok());
        }
        let _ = self.completed_tx.send(true);
    }

    /// Test-and-set the started flag. Returns `true` for the caller that
    /// performed the transition; that caller is responsible for driving the
    /// operation.
    pub fn mark_started(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.started {
            false
        } else {
            inner.started = true;
            true
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    /// Resolve once the terminal frame has been emitted. Returns immediately
    /// if the operation already completed.
    pub async fn wait_completed(&self) {
        let mut rx = self.completed_tx.subscribe();
        // The sender lives as long as `self`, so this cannot error.
        let _ = rx.wait_for(|completed| *completed).await;
    }

    /// Snapshot of the log, for status inspection and tests.
    pub fn log_snapshot(&self) -> Vec<OperationMessage> {
        self.inner.lock().log.clone()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
