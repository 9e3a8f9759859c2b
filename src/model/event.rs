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

//! Progress events emitted while a task runs.
//!
//! Events are serialized as JSON objects with a `type` tag, for example
//! `{"taskId":"…","type":"overall","progress":50,"completed":1,"failed":0,"cancelled":0}`.

use serde::{Deserialize, Serialize};

use super::task::{SubTaskStatus, TaskStatus};

/// Final counters of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub status: TaskStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub overall_progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TaskEvent {
    #[serde(rename = "started")]
    Started { total: usize, concurrency: usize },

    #[serde(rename = "subtask:update")]
    SubTaskUpdate {
        subtask_id: String,
        status: SubTaskStatus,
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<u32>,
    },

    #[serde(rename = "overall")]
    Overall {
        progress: u8,
        completed: usize,
        failed: usize,
        cancelled: usize,
    },

    #[serde(rename = "completed")]
    Completed { summary: TaskSummary },

    #[serde(rename = "failed")]
    Failed { summary: TaskSummary },

    #[serde(rename = "partially-completed")]
    PartiallyCompleted { summary: TaskSummary },

    #[serde(rename = "cancelled")]
    Cancelled { summary: TaskSummary },

    /// Raw output chunk; may be duplicated or reordered relative to other events.
    #[serde(rename = "log")]
    Log { subtask_id: String, chunk: String },
}

impl TaskEvent {
    /// The terminal event matching `summary.status`.
    ///
    /// A non-terminal status maps to `cancelled`.
    pub fn finished(summary: TaskSummary) -> Self {
        match summary.status {
            TaskStatus::Completed => Self::Completed { summary },
            TaskStatus::Failed => Self::Failed { summary },
            TaskStatus::PartiallyCompleted => Self::PartiallyCompleted { summary },
            TaskStatus::Cancelled | TaskStatus::Queued | TaskStatus::InProgress => {
                Self::Cancelled { summary }
            }
        }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::SubTaskUpdate { .. } => "subtask:update",
            Self::Overall { .. } => "overall",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::PartiallyCompleted { .. } => "partially-completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Log { .. } => "log",
        }
    }
}

/// An event addressed to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventEnvelope {
    pub task_id: String,
    #[serde(flatten)]
    pub event: TaskEvent,
}

impl TaskEventEnvelope {
    pub fn new(task_id: impl Into<String>, event: TaskEvent) -> Self {
        Self {
            task_id: task_id.into(),
            event,
        }
    }
}
