//! Progress/Event bus: per-task broadcast fan-out.
//!
//! Subscribers see events for one task in non-decreasing percent order; the
//! task manager clamps percent before publishing. Late joiners get a
//! synthetic snapshot (built from the store by the API layer) before live
//! events resume.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use engine::graph::{AssetKind, NodeStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageChanged {
        task_id: String,
        stage: String,
    },
    NodeProgress {
        task_id: String,
        node_id: String,
        kind: AssetKind,
        status: NodeStatus,
    },
    TaskProgress {
        task_id: String,
        percent: f64,
        stage: String,
        message: String,
    },
    Completed {
        task_id: String,
        video_url: String,
        thumbnail_url: String,
    },
    Error {
        task_id: String,
        message: String,
        node_id: Option<String>,
    },
}

pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, task_id: &str) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Fan an event out to current subscribers. No subscribers is fine; the
    /// store remains the source of truth for polling clients.
    pub fn publish(&self, task_id: &str, event: ProgressEvent) {
        let _ = self.sender(task_id).send(event);
    }

    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<ProgressEvent> {
        self.sender(task_id).subscribe()
    }

    /// Drop the channel once a task is terminal and drained.
    pub fn forget(&self, task_id: &str) {
        self.channels.lock().unwrap().remove(task_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
