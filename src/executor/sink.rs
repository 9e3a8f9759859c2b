// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Progress event delivery.

use tokio::sync::broadcast;

use crate::model::TaskEventEnvelope;

/// Receives task progress events.
///
/// `emit` must not block; delivery failures are the sink's own concern and
/// never affect the task.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEventEnvelope);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: TaskEventEnvelope) {}
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than blocking the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<TaskEventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: TaskEventEnvelope) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for task event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskEvent;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();

        sink.emit(TaskEventEnvelope::new(
            "t1",
            TaskEvent::Started {
                total: 2,
                concurrency: 1,
            },
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.task_id, "t1");
        assert_eq!(received.event.kind(), "started");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::default();
        sink.emit(TaskEventEnvelope::new(
            "t1",
            TaskEvent::Log {
                subtask_id: "s".to_string(),
                chunk: "x".to_string(),
            },
        ));
        NullEventSink.emit(TaskEventEnvelope::new(
            "t1",
            TaskEvent::Log {
                subtask_id: "s".to_string(),
                chunk: "x".to_string(),
            },
        ));
    }
}
