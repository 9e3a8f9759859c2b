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

//! Batch tasks and their per-target subtasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::shared::ConfigurationError;

/// Lifecycle of a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    PartiallyCompleted,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyCompleted => "partially-completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one command on one target.
///
/// Statuses only move forward: `queued -> connecting -> running -> terminal`.
/// Skipping ahead is allowed, going back or leaving a terminal state is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubTaskStatus {
    Queued,
    Connecting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Connecting => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Re-applying the current non-terminal status is accepted.
    pub fn can_transition_to(&self, next: SubTaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to run on every target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Per-subtask deadline, counted from dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }
}

/// One target of a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTarget {
    pub connection_id: String,
    /// Display name; defaults to the connection id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TaskTarget {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Input for creating a batch task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub owner: String,
    pub spec: CommandSpec,
    pub targets: Vec<TaskTarget>,
    /// Falls back to the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
}

impl TaskRequest {
    pub fn new<I, S>(owner: impl Into<String>, spec: CommandSpec, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owner: owner.into(),
            spec,
            targets: targets.into_iter().map(TaskTarget::new).collect(),
            concurrency_limit: None,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Reject requests that could never run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.spec.command.trim().is_empty() {
            return Err(ConfigurationError::invalid("command", "must not be empty"));
        }
        if self.concurrency_limit == Some(0) {
            return Err(ConfigurationError::invalid(
                "concurrency limit",
                "must be at least 1",
            ));
        }
        if self.spec.timeout_seconds == Some(0) {
            return Err(ConfigurationError::invalid(
                "timeout seconds",
                "must be at least 1",
            ));
        }
        if let Some(target) = self.targets.iter().find(|t| t.connection_id.trim().is_empty()) {
            return Err(ConfigurationError::invalid(
                "target",
                format!("empty connection id (name {:?})", target.name),
            ));
        }
        Ok(())
    }
}

/// One command execution against one target connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    pub task_id: String,
    pub connection_id: String,
    pub name: String,
    pub command: String,
    pub status: SubTaskStatus,
    pub progress: u8,
    pub exit_code: Option<u32>,
    /// Captured output, never longer than the configured maximum.
    pub output: String,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A batch of subtasks sharing one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub status: TaskStatus,
    pub concurrency_limit: usize,
    pub overall_progress: u8,
    pub total_subtasks: usize,
    pub completed_subtasks: usize,
    pub failed_subtasks: usize,
    pub cancelled_subtasks: usize,
    pub spec: CommandSpec,
    pub subtasks: Vec<SubTask>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn settled_subtasks(&self) -> usize {
        self.completed_subtasks + self.failed_subtasks + self.cancelled_subtasks
    }

    pub fn subtask(&self, subtask_id: &str) -> Option<&SubTask> {
        self.subtasks.iter().find(|s| s.id == subtask_id)
    }
}

/// Fields written alongside a task status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: Option<TaskProgress>,
    pub message: Option<String>,
}

/// Aggregate counters after a subtask settles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub overall_progress: u8,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskProgress {
    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// `round(100 * settled / total)`; zero total counts as done.
    pub fn percent(settled: usize, total: usize) -> u8 {
        if total == 0 {
            return 100;
        }
        let pct = (settled.min(total) as f64 * 100.0 / total as f64).round();
        pct as u8
    }
}

/// Fields written alongside a subtask status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubTaskUpdate {
    pub message: Option<String>,
    pub exit_code: Option<u32>,
    /// Replaces the stored output when set.
    pub output: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}
