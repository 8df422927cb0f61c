// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Event stream toward the UI boundary.
//!
//! Every status change and throttled progress update fans out over one
//! broadcast channel. Events for a single task are emitted by a single
//! worker (or the scheduler, never both at once), so per-task delivery
//! order is total; no ordering is guaranteed across tasks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::task::TaskStatus;

/// Channel capacity; slow UI consumers lag rather than block workers.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One notification toward the UI boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        id: String,
        status: TaskStatus,
    },
    ProgressUpdated {
        id: String,
        percent: f64,
        speed_bps: Option<u64>,
        eta_seconds: Option<u64>,
    },
    /// Informative text worth showing next to the task (merge stage,
    /// post-processing, retry notices).
    MessageLogged {
        id: String,
        message: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::StatusChanged { id, .. } => id,
            TaskEvent::ProgressUpdated { id, .. } => id,
            TaskEvent::MessageLogged { id, .. } => id,
        }
    }
}

/// Create the event channel pair.
pub fn channel() -> (broadcast::Sender<TaskEvent>, broadcast::Receiver<TaskEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_task_id() {
        let ev = TaskEvent::StatusChanged {
            id: "abcd1234".into(),
            status: TaskStatus::Running,
        };
        assert_eq!(ev.task_id(), "abcd1234");
    }

    #[tokio::test]
    async fn test_broadcast_delivery() {
        let (tx, mut rx) = channel();
        tx.send(TaskEvent::MessageLogged {
            id: "t1".into(),
            message: "merging".into(),
        })
        .unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.task_id(), "t1");
    }
}
