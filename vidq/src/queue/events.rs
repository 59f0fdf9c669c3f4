//! Queue events.
//!
//! Every store mutation made by the queue is announced on a broadcast channel so front-ends
//! can mirror state without polling.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::database::models::Partition;
use crate::domain::DownloadRecord;
use crate::downloader::LifecycleSnapshot;

/// Events broadcast by the download queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A record was admitted into a partition.
    Added {
        partition: Partition,
        record: Box<DownloadRecord>,
    },
    /// A running download reported progress.
    Progress { snapshot: Box<LifecycleSnapshot> },
    /// A record finished running and moved to history.
    Completed { record: Box<DownloadRecord> },
    /// A pending record changed without running (start/pause).
    Updated { record: Box<DownloadRecord> },
    /// A record was deleted.
    Removed { partition: Partition, id: String },
    Paused,
    Resumed,
}

impl QueueEvent {
    /// Short description for logging.
    pub fn description(&self) -> String {
        match self {
            Self::Added { partition, record } => {
                format!("Added to {}: {}", partition, record.title)
            }
            Self::Progress { snapshot } => {
                format!("Progress {}: {}", snapshot.item_id, snapshot.status)
            }
            Self::Completed { record } => format!("Completed {}: {}", record.title, record.status),
            Self::Updated { record } => format!("Updated {}", record.title),
            Self::Removed { partition, id } => format!("Removed from {}: {}", partition, id),
            Self::Paused => "Queue paused".to_string(),
            Self::Resumed => "Queue resumed".to_string(),
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for queue events.
#[derive(Clone)]
pub struct QueueEventBroadcaster {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers; 0 without subscribers.
    pub fn publish(&self, event: QueueEvent) -> usize {
        if !matches!(event, QueueEvent::Progress { .. }) {
            tracing::debug!("Publishing queue event: {}", event.description());
        }
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for QueueEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
