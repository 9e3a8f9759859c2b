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

//! Task persistence.
//!
//! This module defines the trait the orchestrator writes through, as well as
//! an in-memory implementation.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::model::{SubTaskStatus, SubTaskUpdate, Task, TaskProgress, TaskStatus, TaskUpdate};

/// Storage for tasks and their subtasks.
///
/// Implementations must be thread-safe. A task and its subtasks are created
/// together and deleted together.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task with all of its subtasks.
    async fn create_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Tasks, newest first, optionally restricted to one owner.
    async fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>>;

    /// Change the task status and apply `update`.
    ///
    /// # Errors
    ///
    /// Returns an error if the task does not exist or is already terminal.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<()>;

    /// Change a subtask status and apply `update`.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-monotonic transition.
    async fn update_subtask_status(
        &self,
        task_id: &str,
        subtask_id: &str,
        status: SubTaskStatus,
        progress: u8,
        update: SubTaskUpdate,
    ) -> Result<()>;

    /// Append a chunk to the stored output. Never rewrites earlier output.
    async fn append_subtask_output(&self, subtask_id: &str, chunk: &str) -> Result<()>;

    /// Mark every non-terminal subtask of a task cancelled; returns how many changed.
    async fn cancel_subtasks(&self, task_id: &str, reason: &str) -> Result<usize>;

    /// Delete a task and its subtasks; `false` if it did not exist.
    async fn delete_task(&self, task_id: &str) -> Result<bool>;

    /// Delete finished tasks created more than `days` days ago; returns how many.
    async fn cleanup_older_than(&self, days: u32) -> Result<usize>;
}

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<String, Task>,
    /// subtask id -> task id
    subtask_index: HashMap<String, String>,
}

/// [`TaskStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tables: RwLock<Tables>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            bail!("task '{}' already exists", task.id);
        }
        for subtask in &task.subtasks {
            tables
                .subtask_index
                .insert(subtask.id.clone(), task.id.clone());
        }
        tables.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| owner.map_or(true, |o| t.owner == o))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("task '{task_id}' not found"))?;
        if task.status.is_terminal() {
            bail!("task '{task_id}' is already {}", task.status);
        }

        task.status = status;
        if let Some(started_at) = update.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(ended_at) = update.ended_at {
            task.ended_at = Some(ended_at);
        }
        if let Some(progress) = update.progress {
            task.overall_progress = progress.overall_progress;
            task.completed_subtasks = progress.completed;
            task.failed_subtasks = progress.failed;
            task.cancelled_subtasks = progress.cancelled;
        }
        if update.message.is_some() {
            task.message = update.message;
        }
        Ok(())
    }

    async fn update_subtask_status(
        &self,
        task_id: &str,
        subtask_id: &str,
        status: SubTaskStatus,
        progress: u8,
        update: SubTaskUpdate,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let subtask = tables
            .tasks
            .get_mut(task_id)
            .and_then(|t| t.subtasks.iter_mut().find(|s| s.id == subtask_id))
            .ok_or_else(|| anyhow!("subtask '{subtask_id}' of task '{task_id}' not found"))?;

        if !subtask.status.can_transition_to(status) {
            bail!(
                "subtask '{subtask_id}' cannot move from {} to {status}",
                subtask.status
            );
        }

        subtask.status = status;
        subtask.progress = progress.min(100);
        if update.message.is_some() {
            subtask.message = update.message;
        }
        if update.exit_code.is_some() {
            subtask.exit_code = update.exit_code;
        }
        if let Some(output) = update.output {
            subtask.output = output;
        }
        if let Some(started_at) = update.started_at {
            subtask.started_at = Some(started_at);
        }
        if let Some(ended_at) = update.ended_at {
            subtask.ended_at = Some(ended_at);
        }
        Ok(())
    }

    async fn append_subtask_output(&self, subtask_id: &str, chunk: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let task_id = tables
            .subtask_index
            .get(subtask_id)
            .cloned()
            .ok_or_else(|| anyhow!("subtask '{subtask_id}' not found"))?;
        let subtask = tables
            .tasks
            .get_mut(&task_id)
            .and_then(|t| t.subtasks.iter_mut().find(|s| s.id == subtask_id))
            .ok_or_else(|| anyhow!("subtask '{subtask_id}' not found"))?;
        subtask.output.push_str(chunk);
        Ok(())
    }

    async fn cancel_subtasks(&self, task_id: &str, reason: &str) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("task '{task_id}' not found"))?;

        let now = Utc::now();
        let mut cancelled = 0;
        for subtask in task.subtasks.iter_mut().filter(|s| !s.status.is_terminal()) {
            subtask.status = SubTaskStatus::Cancelled;
            subtask.progress = 100;
            subtask.message = Some(reason.to_string());
            subtask.ended_at = Some(now);
            cancelled += 1;
        }

        let completed = count(task, SubTaskStatus::Completed);
        let failed = count(task, SubTaskStatus::Failed);
        let cancelled_total = count(task, SubTaskStatus::Cancelled);
        task.completed_subtasks = completed;
        task.failed_subtasks = failed;
        task.cancelled_subtasks = cancelled_total;
        task.overall_progress =
            TaskProgress::percent(completed + failed + cancelled_total, task.total_subtasks);
        Ok(cancelled)
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(task) = tables.tasks.remove(task_id) else {
            return Ok(false);
        };
        for subtask in &task.subtasks {
            tables.subtask_index.remove(&subtask.id);
        }
        Ok(true)
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut tables = self.tables.write().await;
        let expired: Vec<String> = tables
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.created_at < cutoff)
            .map(|t| t.id.clone())
            .collect();

        for task_id in &expired {
            if let Some(task) = tables.tasks.remove(task_id) {
                for subtask in &task.subtasks {
                    tables.subtask_index.remove(&subtask.id);
                }
            }
        }
        Ok(expired.len())
    }
}

fn count(task: &Task, status: SubTaskStatus) -> usize {
    task.subtasks.iter().filter(|s| s.status == status).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandSpec, SubTask};

    fn sample_task(id: &str, owner: &str, subtasks: usize) -> Task {
        let subtasks = (0..subtasks)
            .map(|i| SubTask {
                id: format!("{id}-s{i}"),
                task_id: id.to_string(),
                connection_id: format!("conn-{i}"),
                name: format!("conn-{i}"),
                command: "uptime".to_string(),
                status: SubTaskStatus::Queued,
                progress: 0,
                exit_code: None,
                output: String::new(),
                message: None,
                started_at: None,
                ended_at: None,
            })
            .collect::<Vec<_>>();
        Task {
            id: id.to_string(),
            owner: owner.to_string(),
            status: TaskStatus::Queued,
            concurrency_limit: 2,
            overall_progress: 0,
            total_subtasks: subtasks.len(),
            completed_subtasks: 0,
            failed_subtasks: 0,
            cancelled_subtasks: 0,
            spec: CommandSpec::new("uptime"),
            subtasks,
            message: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = InMemoryTaskStore::new();
        store.create_task(&sample_task("t1", "alice", 2)).await.unwrap();
        assert!(store.create_task(&sample_task("t1", "alice", 1)).await.is_err());

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.subtasks.len(), 2);

        assert!(store.delete_task("t1").await.unwrap());
        assert!(!store.delete_task("t1").await.unwrap());
        assert!(store.get_task("t1").await.unwrap().is_none());
        assert!(store.append_subtask_output("t1-s0", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_subtask_transitions_are_monotonic() {
        let store = InMemoryTaskStore::new();
        store.create_task(&sample_task("t1", "alice", 1)).await.unwrap();

        store
            .update_subtask_status("t1", "t1-s0", SubTaskStatus::Running, 50, SubTaskUpdate::default())
            .await
            .unwrap();
        assert!(store
            .update_subtask_status("t1", "t1-s0", SubTaskStatus::Connecting, 10, SubTaskUpdate::default())
            .await
            .is_err());

        store
            .update_subtask_status(
                "t1",
                "t1-s0",
                SubTaskStatus::Completed,
                100,
                SubTaskUpdate {
                    exit_code: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store
            .update_subtask_status("t1", "t1-s0", SubTaskStatus::Failed, 100, SubTaskUpdate::default())
            .await
            .is_err());

        let subtask = store.get_task("t1").await.unwrap().unwrap().subtasks.remove(0);
        assert_eq!(subtask.status, SubTaskStatus::Completed);
        assert_eq!(subtask.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_append_output_is_additive() {
        let store = InMemoryTaskStore::new();
        store.create_task(&sample_task("t1", "alice", 1)).await.unwrap();
        store.append_subtask_output("t1-s0", "hello ").await.unwrap();
        store.append_subtask_output("t1-s0", "world").await.unwrap();

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.subtasks[0].output, "hello world");
    }

    #[tokio::test]
    async fn test_cancel_subtasks_skips_terminal() {
        let store = InMemoryTaskStore::new();
        store.create_task(&sample_task("t1", "alice", 3)).await.unwrap();
        store
            .update_subtask_status("t1", "t1-s0", SubTaskStatus::Completed, 100, SubTaskUpdate::default())
            .await
            .unwrap();

        assert_eq!(store.cancel_subtasks("t1", "stopped").await.unwrap(), 2);
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.completed_subtasks, 1);
        assert_eq!(task.cancelled_subtasks, 2);
        assert_eq!(task.overall_progress, 100);
        assert_eq!(task.subtasks[1].message.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_terminal_task_is_immutable() {
        let store = InMemoryTaskStore::new();
        store.create_task(&sample_task("t1", "alice", 0)).await.unwrap();
        store
            .update_task_status("t1", TaskStatus::Cancelled, TaskUpdate::default())
            .await
            .unwrap();
        assert!(store
            .update_task_status("t1", TaskStatus::InProgress, TaskUpdate::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_and_cleanup() {
        let store = InMemoryTaskStore::new();
        let mut old = sample_task("old", "alice", 1);
        old.created_at = Utc::now() - ChronoDuration::days(40);
        old.status = TaskStatus::Completed;
        let mut old_running = sample_task("old-running", "bob", 1);
        old_running.created_at = Utc::now() - ChronoDuration::days(40);
        old_running.status = TaskStatus::InProgress;

        store.create_task(&old).await.unwrap();
        store.create_task(&old_running).await.unwrap();
        store.create_task(&sample_task("new", "alice", 1)).await.unwrap();

        let alice = store.list_tasks(Some("alice")).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].id, "new");

        assert_eq!(store.cleanup_older_than(30).await.unwrap(), 1);
        assert!(store.get_task("old").await.unwrap().is_none());
        assert!(store.get_task("old-running").await.unwrap().is_some());
        assert_eq!(store.len().await, 2);
    }
}
