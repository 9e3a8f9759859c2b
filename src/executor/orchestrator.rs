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

//! Batch task orchestration.
//!
//! A task run lives on one tokio task. Subtasks are spawned individually and
//! collected through a [`FuturesUnordered`] that never holds more than the
//! task's concurrency limit; their results are folded into the counters one
//! at a time by the run loop, so the counters need no locking.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::build_command_line;
use super::registry::CancellationRegistry;
use super::runner::{sleep_until_deadline, CommandRunner};
use super::sink::EventSink;
use super::status::finalize_status;
use super::store::TaskStore;
use crate::config::EngineConfig;
use crate::model::{
    SubTask, SubTaskStatus, SubTaskUpdate, Task, TaskEvent, TaskEventEnvelope, TaskProgress,
    TaskRequest, TaskStatus, TaskSummary, TaskUpdate,
};
use crate::session::Connector;
use crate::shared::TaskError;

/// How long [`BatchOrchestrator::delete`] waits for a live run to wind down.
const DELETE_GRACE: Duration = Duration::from_secs(10);

const CANCELLED_BEFORE_START: &str = "Task cancelled before this subtask started";
const CANCELLED_WHILE_FINISHING: &str = "Task cancelled while the command was finishing";

struct Inner {
    connector: Arc<dyn Connector>,
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn EventSink>,
    registry: Arc<CancellationRegistry>,
    runner: CommandRunner,
    config: EngineConfig,
    max_observed_active: AtomicUsize,
}

impl Inner {
    fn emit(&self, task_id: &str, event: TaskEvent) {
        self.sink.emit(TaskEventEnvelope::new(task_id, event));
    }

    /// Persist an intermediate subtask status and announce it.
    async fn mark(
        &self,
        task_id: &str,
        subtask_id: &str,
        status: SubTaskStatus,
        progress: u8,
        update: SubTaskUpdate,
    ) {
        let message = update.message.clone();
        if let Err(e) = self
            .store
            .update_subtask_status(task_id, subtask_id, status, progress, update)
            .await
        {
            warn!("Failed to record {status} for subtask {subtask_id}: {e:#}");
        }
        self.emit(
            task_id,
            TaskEvent::SubTaskUpdate {
                subtask_id: subtask_id.to_string(),
                status,
                progress,
                message,
                output: None,
                exit_code: None,
            },
        );
    }
}

/// Removes the registry entry when a run ends, even by panic.
struct RunGuard {
    registry: Arc<CancellationRegistry>,
    task_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.task_id);
    }
}

/// Result of one subtask, folded into the task by the run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SubTaskResult {
    status: SubTaskStatus,
    exit_code: Option<u32>,
    output: String,
    message: String,
    timed_out: bool,
}

impl SubTaskResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: SubTaskStatus::Failed,
            exit_code: None,
            output: String::new(),
            message: message.into(),
            timed_out: false,
        }
    }

    fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: SubTaskStatus::Cancelled,
            ..Self::failed(message)
        }
    }

    fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::cancelled("Subtask timed out")
        }
    }
}

/// Handle to a task submitted with [`BatchOrchestrator::submit`].
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    join: JoinHandle<Result<Task, TaskError>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the run to finish and return the final task.
    pub async fn wait(self) -> Result<Task, TaskError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Aborted(e.to_string())),
        }
    }
}

/// Creates batch tasks and drives them to completion.
///
/// Cloning is cheap; clones share the store, the sink and the cancellation
/// registry.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl BatchOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self::with_registry(
            connector,
            store,
            sink,
            config,
            Arc::new(CancellationRegistry::new()),
        )
    }

    /// Build an orchestrator around an existing registry.
    pub fn with_registry(
        connector: Arc<dyn Connector>,
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
        registry: Arc<CancellationRegistry>,
    ) -> Self {
        let runner = CommandRunner::new(
            Arc::clone(&store),
            Arc::clone(&sink),
            config.max_output_bytes.max(1),
            config.output_flush_interval(),
        );
        Self {
            inner: Arc::new(Inner {
                connector,
                store,
                sink,
                registry,
                runner,
                config,
                max_observed_active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate a request and persist it as a queued task.
    pub async fn create_task(&self, request: TaskRequest) -> Result<Task, TaskError> {
        request.validate()?;
        let command_line = build_command_line(&request.spec)?;
        let concurrency_limit = request
            .concurrency_limit
            .unwrap_or(self.inner.config.default_concurrency)
            .max(1);

        let task_id = Uuid::new_v4().to_string();
        let subtasks: Vec<SubTask> = request
            .targets
            .into_iter()
            .map(|target| SubTask {
                id: Uuid::new_v4().to_string(),
                task_id: task_id.clone(),
                name: target.name.unwrap_or_else(|| target.connection_id.clone()),
                connection_id: target.connection_id,
                command: command_line.clone(),
                status: SubTaskStatus::Queued,
                progress: 0,
                exit_code: None,
                output: String::new(),
                message: None,
                started_at: None,
                ended_at: None,
            })
            .collect();

        let task = Task {
            id: task_id,
            owner: request.owner,
            status: TaskStatus::Queued,
            concurrency_limit,
            overall_progress: 0,
            total_subtasks: subtasks.len(),
            completed_subtasks: 0,
            failed_subtasks: 0,
            cancelled_subtasks: 0,
            spec: request.spec,
            subtasks,
            message: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };

        self.inner
            .store
            .create_task(&task)
            .await
            .map_err(TaskError::Store)?;
        debug!(
            "Created task {} with {} subtasks for {}",
            task.id, task.total_subtasks, task.owner
        );
        Ok(task)
    }

    /// Drive an already created task to completion.
    ///
    /// The task is loaded from the store. One that is already terminal there
    /// is returned as stored.
    pub async fn run_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let (_guard, cancel) = self.register(task_id)?;
        self.run_registered(task_id, cancel).await
    }

    /// Create a task and run it on the runtime in the background.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskHandle, TaskError> {
        let task = self.create_task(request).await?;
        let (guard, cancel) = self.register(&task.id)?;

        let this = self.clone();
        let task_id = task.id.clone();
        let join = tokio::spawn(async move {
            let _guard = guard;
            this.run_registered(&task.id, cancel).await
        });
        Ok(TaskHandle { task_id, join })
    }

    /// Create a task and run it to completion.
    pub async fn execute(&self, request: TaskRequest) -> Result<Task, TaskError> {
        let task = self.create_task(request).await?;
        self.run_task(&task.id).await
    }

    /// Cancel a task.
    ///
    /// A live run is signalled and finalizes itself. A task without a live
    /// run that is still open in the store is cancelled there directly.
    /// Returns `false` for unknown or already finished tasks.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        if self.inner.registry.cancel(task_id) {
            info!("Cancellation requested for task {task_id}");
            return Ok(true);
        }

        let Some(task) = self.get(task_id).await? else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }

        let store = &self.inner.store;
        let changed = store
            .cancel_subtasks(task_id, CANCELLED_BEFORE_START)
            .await
            .map_err(TaskError::Store)?;
        let task = store
            .get_task(task_id)
            .await
            .map_err(TaskError::Store)?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        let counts = TaskProgress {
            overall_progress: task.overall_progress,
            completed: task.completed_subtasks,
            failed: task.failed_subtasks,
            cancelled: task.cancelled_subtasks,
        };
        let message = "Task cancelled".to_string();
        store
            .update_task_status(
                task_id,
                TaskStatus::Cancelled,
                TaskUpdate {
                    ended_at: Some(Utc::now()),
                    progress: Some(counts),
                    message: Some(message.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(TaskError::Store)?;

        self.inner.emit(
            task_id,
            TaskEvent::finished(summary(TaskStatus::Cancelled, task.total_subtasks, &counts, message)),
        );
        info!("Cancelled idle task {task_id} ({changed} subtasks)");
        Ok(true)
    }

    /// Delete a task, cancelling it first if it is still open.
    pub async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        let finished = self.inner.registry.finished_signal(task_id);
        self.cancel(task_id).await?;

        if let Some(finished) = finished {
            if tokio::time::timeout(DELETE_GRACE, finished.cancelled())
                .await
                .is_err()
            {
                warn!(
                    "Task {task_id} did not stop within {}s, deleting anyway",
                    DELETE_GRACE.as_secs()
                );
            }
        }

        let deleted = self
            .inner
            .store
            .delete_task(task_id)
            .await
            .map_err(TaskError::Store)?;
        if deleted {
            info!("Deleted task {task_id}");
        }
        Ok(deleted)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        self.inner
            .store
            .get_task(task_id)
            .await
            .map_err(TaskError::Store)
    }

    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<Task>, TaskError> {
        self.inner
            .store
            .list_tasks(owner)
            .await
            .map_err(TaskError::Store)
    }

    /// Ids of tasks with a live run.
    pub fn active_task_ids(&self) -> Vec<String> {
        self.inner.registry.active_ids()
    }

    /// Delete finished tasks older than `days` days.
    ///
    /// Only terminal tasks are removed, so tasks with a live run are never touched.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<usize, TaskError> {
        let removed = self
            .inner
            .store
            .cleanup_older_than(days)
            .await
            .map_err(TaskError::Store)?;
        if removed > 0 {
            info!("Removed {removed} tasks older than {days} days");
        }
        Ok(removed)
    }

    /// [`cleanup_older_than`](Self::cleanup_older_than) with the configured retention.
    pub async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        self.cleanup_older_than(self.inner.config.retention_days)
            .await
    }

    /// Most subtasks ever active at once in a single run of this orchestrator.
    pub fn max_observed_active(&self) -> usize {
        self.inner.max_observed_active.load(Ordering::Relaxed)
    }

    fn register(&self, task_id: &str) -> Result<(RunGuard, CancellationToken), TaskError> {
        let cancel = self
            .inner
            .registry
            .register(task_id)
            .ok_or_else(|| TaskError::AlreadyRunning(task_id.to_string()))?;
        let guard = RunGuard {
            registry: Arc::clone(&self.inner.registry),
            task_id: task_id.to_string(),
        };
        Ok((guard, cancel))
    }

    async fn run_registered(&self, task_id: &str, cancel: CancellationToken) -> Result<Task, TaskError> {
        let task = self
            .get(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            debug!("Task {task_id} is already {}", task.status);
            return Ok(task);
        }
        self.drive(task, cancel).await
    }

    async fn drive(&self, mut task: Task, cancel: CancellationToken) -> Result<Task, TaskError> {
        let inner = &self.inner;
        let task_id = task.id.clone();
        let total = task.subtasks.len();
        let limit = task.concurrency_limit.max(1);

        let started_at = Utc::now();
        inner
            .store
            .update_task_status(
                &task_id,
                TaskStatus::InProgress,
                TaskUpdate {
                    started_at: Some(started_at),
                    ..Default::default()
                },
            )
            .await
            .map_err(TaskError::Store)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(started_at);
        inner.emit(
            &task_id,
            TaskEvent::Started {
                total,
                concurrency: limit,
            },
        );
        info!("Task {task_id} started: {total} subtasks, concurrency {limit}");

        let timeout = task.spec.timeout_seconds.map(Duration::from_secs);
        let mut queue: VecDeque<usize> = (0..total).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut counts = TaskProgress::default();
        let mut max_active = 0;

        loop {
            while in_flight.len() < limit && !cancel.is_cancelled() {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                let subtask = &task.subtasks[index];
                let job = SubTaskJob {
                    inner: Arc::clone(inner),
                    task_id: task_id.clone(),
                    subtask_id: subtask.id.clone(),
                    connection_id: subtask.connection_id.clone(),
                    name: subtask.name.clone(),
                    command_line: subtask.command.clone(),
                    cancel: cancel.child_token(),
                    deadline: timeout.map(|after| Instant::now() + after),
                };
                let handle = tokio::spawn(job.run());
                in_flight.push(async move { (index, handle.await) });
                max_active = max_active.max(in_flight.len());
            }

            if cancel.is_cancelled() {
                while let Some(index) = queue.pop_front() {
                    let result = SubTaskResult::cancelled(CANCELLED_BEFORE_START);
                    self.settle(&mut task, index, result, &mut counts).await;
                }
            }

            let Some((index, joined)) = in_flight.next().await else {
                break;
            };
            let result = joined.unwrap_or_else(|e| {
                error!(
                    "Subtask {} of task {task_id} aborted: {e}",
                    task.subtasks[index].id
                );
                SubTaskResult::failed(format!("Subtask aborted: {e}"))
            });
            self.settle(&mut task, index, result, &mut counts).await;
        }

        inner
            .max_observed_active
            .fetch_max(max_active, Ordering::Relaxed);

        counts.overall_progress = TaskProgress::percent(counts.settled(), total);
        task.overall_progress = counts.overall_progress;
        let status = finalize_status(&counts, total, cancel.is_cancelled());
        let message = format!(
            "{} completed, {} failed, {} cancelled",
            counts.completed, counts.failed, counts.cancelled
        );
        let ended_at = Utc::now();
        if let Err(e) = inner
            .store
            .update_task_status(
                &task_id,
                status,
                TaskUpdate {
                    ended_at: Some(ended_at),
                    progress: Some(counts),
                    message: Some(message.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!("Failed to record final status of task {task_id}: {e:#}");
        }

        task.status = status;
        task.ended_at = Some(ended_at);
        task.message = Some(message.clone());
        inner.emit(
            &task_id,
            TaskEvent::finished(summary(status, total, &counts, message)),
        );
        info!(
            "Task {task_id} finished as {status}: {} completed, {} failed, {} cancelled (max active {max_active})",
            counts.completed, counts.failed, counts.cancelled
        );
        Ok(task)
    }

    /// Fold one subtask result into the task, the store and the event stream.
    async fn settle(
        &self,
        task: &mut Task,
        index: usize,
        result: SubTaskResult,
        counts: &mut TaskProgress,
    ) {
        let inner = &self.inner;
        let ended_at = Utc::now();
        let subtask = &mut task.subtasks[index];

        if result.timed_out {
            debug!("Subtask {} on {} timed out", subtask.id, subtask.name);
        }

        // Output already reached the store through the throttled writer.
        if let Err(e) = inner
            .store
            .update_subtask_status(
                &task.id,
                &subtask.id,
                result.status,
                100,
                SubTaskUpdate {
                    message: Some(result.message.clone()),
                    exit_code: result.exit_code,
                    output: None,
                    started_at: None,
                    ended_at: Some(ended_at),
                },
            )
            .await
        {
            warn!("Failed to record result of subtask {}: {e:#}", subtask.id);
        }

        subtask.status = result.status;
        subtask.progress = 100;
        subtask.exit_code = result.exit_code;
        subtask.message = Some(result.message.clone());
        subtask.ended_at = Some(ended_at);
        subtask.output = result.output.clone();

        inner.emit(
            &task.id,
            TaskEvent::SubTaskUpdate {
                subtask_id: subtask.id.clone(),
                status: result.status,
                progress: 100,
                message: Some(result.message),
                output: Some(result.output),
                exit_code: result.exit_code,
            },
        );

        match result.status {
            SubTaskStatus::Completed => counts.completed += 1,
            SubTaskStatus::Failed => counts.failed += 1,
            _ => counts.cancelled += 1,
        }
        counts.overall_progress = TaskProgress::percent(counts.settled(), task.total_subtasks);

        task.completed_subtasks = counts.completed;
        task.failed_subtasks = counts.failed;
        task.cancelled_subtasks = counts.cancelled;
        task.overall_progress = counts.overall_progress;

        if let Err(e) = inner
            .store
            .update_task_status(
                &task.id,
                TaskStatus::InProgress,
                TaskUpdate {
                    progress: Some(*counts),
                    ..Default::default()
                },
            )
            .await
        {
            warn!("Failed to record progress of task {}: {e:#}", task.id);
        }

        inner.emit(
            &task.id,
            TaskEvent::Overall {
                progress: counts.overall_progress,
                completed: counts.completed,
                failed: counts.failed,
                cancelled: counts.cancelled,
            },
        );
    }
}

fn summary(status: TaskStatus, total: usize, counts: &TaskProgress, message: String) -> TaskSummary {
    TaskSummary {
        status,
        total,
        completed: counts.completed,
        failed: counts.failed,
        cancelled: counts.cancelled,
        overall_progress: counts.overall_progress,
        message: Some(message),
    }
}

/// Everything one subtask needs, owned so it can be spawned.
struct SubTaskJob {
    inner: Arc<Inner>,
    task_id: String,
    subtask_id: String,
    connection_id: String,
    name: String,
    command_line: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl SubTaskJob {
    async fn run(self) -> SubTaskResult {
        let inner = &self.inner;
        if self.cancel.is_cancelled() {
            return SubTaskResult::cancelled(CANCELLED_BEFORE_START);
        }

        inner
            .mark(
                &self.task_id,
                &self.subtask_id,
                SubTaskStatus::Connecting,
                10,
                SubTaskUpdate {
                    message: Some(format!("Connecting to {}", self.name)),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;

        let connect_timeout = inner.config.connect_timeout();
        let session = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                return SubTaskResult::cancelled("Task cancelled while connecting");
            }
            _ = sleep_until_deadline(self.deadline) => {
                return SubTaskResult::timed_out();
            }
            connected = inner.connector.connect(&self.connection_id, connect_timeout) => {
                match connected {
                    Ok(session) => session,
                    Err(e) => {
                        debug!("Subtask {} could not connect: {e}", self.subtask_id);
                        return SubTaskResult::failed(format!("Connection failed: {e}"));
                    }
                }
            }
        };

        if self.cancel.is_cancelled() {
            session.close().await;
            return SubTaskResult::cancelled("Task cancelled before the command started");
        }

        inner
            .mark(
                &self.task_id,
                &self.subtask_id,
                SubTaskStatus::Running,
                50,
                SubTaskUpdate {
                    message: Some(format!("Running on {}", session.describe())),
                    ..Default::default()
                },
            )
            .await;

        let outcome = inner
            .runner
            .run(
                &self.task_id,
                &self.subtask_id,
                session.as_ref(),
                &self.command_line,
                &self.cancel,
                self.deadline,
            )
            .await;
        session.close().await;

        let mut result = match outcome {
            Ok(outcome) => SubTaskResult {
                status: outcome.status(),
                message: outcome.message(),
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                output: outcome.output,
            },
            Err(e) => SubTaskResult::failed(format!("{e:#}")),
        };
        // A cancellation that lands while the session closes still wins.
        if self.cancel.is_cancelled() && result.status != SubTaskStatus::Cancelled {
            result.status = SubTaskStatus::Cancelled;
            result.message = CANCELLED_WHILE_FINISHING.to_string();
        }
        result
    }
}
