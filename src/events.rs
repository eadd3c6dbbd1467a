//! Processing event bus.
//!
//! Fan-out of pipeline progress to any number of observers (the WebSocket
//! endpoint, tests). Publishing never blocks and never fails; a subscriber
//! that falls behind loses the oldest events and is told how many.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ledger::LedgerEntry;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something observable that happened in a watch session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingEvent {
    SessionStarted {
        session_id: Uuid,
        started_at: DateTime<Utc>,
        /// A single refresh cycle rather than a continuous watch.
        one_shot: bool,
    },
    CycleStarted {
        session_id: Uuid,
        cycle: u64,
    },
    MessageProcessed {
        session_id: Uuid,
        entry: LedgerEntry,
    },
    CycleFinished {
        session_id: Uuid,
        cycle: u64,
        processed: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SessionStopped {
        session_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ProcessingEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::CycleStarted { session_id, .. }
            | Self::MessageProcessed { session_id, .. }
            | Self::CycleFinished { session_id, .. }
            | Self::SessionStopped { session_id, .. } => *session_id,
        }
    }
}

/// Why a subscription produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("subscriber lagged, {0} events missed")]
    Lagged(u64),
    #[error("event bus closed")]
    Closed,
}

/// Broadcast bus for [`ProcessingEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProcessingEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers. Ok if nobody is listening.
    pub fn publish(&self, event: ProcessingEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// One observer's view of the bus.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<ProcessingEvent>,
}

impl EventSubscription {
    /// Next event, in publish order.
    pub async fn recv(&mut self) -> Result<ProcessingEvent, RecvError> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(n) => RecvError::Lagged(n),
            broadcast::error::RecvError::Closed => RecvError::Closed,
        })
    }

    /// Adapt into a stream. Lag is reported in-band; the stream ends when
    /// the bus is dropped.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProcessingEvent, RecvError>> {
        futures::stream::unfold(self, |mut sub| async move {
            match sub.recv().await {
                Err(RecvError::Closed) => None,
                item => Some((item, sub)),
            }
        })
    }
}
