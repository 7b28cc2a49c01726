//! In-process notifications about writes made by the engine.
//!
//! Every write path publishes a [`ProgressEvent`] on the [`EventBus`]. Nothing
//! in the engine depends on anyone listening.

use chrono::{DateTime, Utc};
use progress_core::model::{CacheKind, CourseRunId, UserId};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// One kind of remote data was re-snapshotted for a user.
    CacheRefreshed {
        user_id: UserId,
        kind: CacheKind,
        records: usize,
        at: DateTime<Utc>,
    },
    GradeFrozen {
        user_id: UserId,
        course_run_id: CourseRunId,
        grade: f64,
        passed: bool,
        at: DateTime<Utc>,
    },
    FreezeFailed {
        user_id: UserId,
        course_run_id: CourseRunId,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus over a [`broadcast::Sender`]. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Slow receivers observe `RecvError::Lagged` once `capacity` events are
    /// buffered.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ProgressEvent) {
        // only fails when nobody subscribed
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
