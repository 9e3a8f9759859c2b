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

//! Runs one command on an established session and captures its output.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::output::{OutputBuffer, ThrottledOutputWriter, Utf8ChunkDecoder};
use super::sink::EventSink;
use super::store::TaskStore;
use crate::model::{SubTaskStatus, TaskEvent, TaskEventEnvelope};
use crate::session::{ExecEvent, RemoteSession};

/// How a command run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: Option<u32>,
    pub output: String,
    /// Stopped by cancellation or by the deadline.
    pub cancelled: bool,
    /// Stopped by the deadline.
    pub timed_out: bool,
    /// Output exceeded the capture limit.
    pub truncated: bool,
}

impl RunOutcome {
    /// Terminal subtask status for this outcome.
    pub fn status(&self) -> SubTaskStatus {
        if self.cancelled {
            return SubTaskStatus::Cancelled;
        }
        match self.exit_code {
            Some(0) => SubTaskStatus::Completed,
            _ => SubTaskStatus::Failed,
        }
    }

    pub fn message(&self) -> String {
        if self.timed_out {
            return "Command timed out".to_string();
        }
        if self.cancelled {
            return "Command cancelled".to_string();
        }
        match self.exit_code {
            Some(0) => "Command completed".to_string(),
            Some(code) => format!("Command exited with status {code}"),
            None => "command terminated without an exit status".to_string(),
        }
    }
}

/// Executes commands and streams their output to the sink and the store.
pub struct CommandRunner {
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn EventSink>,
    max_output_bytes: usize,
    flush_interval: Duration,
}

impl CommandRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn EventSink>,
        max_output_bytes: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            max_output_bytes,
            flush_interval,
        }
    }

    /// Run `command_line` until it exits, `cancel` fires or `deadline` passes.
    ///
    /// Cancellation and the deadline both terminate the remote process; the
    /// outcome is then `cancelled`, with `timed_out` set for the deadline.
    pub async fn run(
        &self,
        task_id: &str,
        subtask_id: &str,
        session: &dyn RemoteSession,
        command_line: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RunOutcome> {
        let mut channel = session
            .exec(command_line)
            .await
            .with_context(|| format!("Failed to start command on {}", session.describe()))?;

        let mut buffer = OutputBuffer::new(self.max_output_bytes);
        let mut writer = ThrottledOutputWriter::new(
            Arc::clone(&self.store),
            subtask_id,
            self.max_output_bytes,
            self.flush_interval,
        );
        let mut decoder = Utf8ChunkDecoder::new();
        let mut exit_code = None;
        let mut timed_out = false;

        loop {
            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Terminating command on {} after cancellation", session.describe());
                    channel.terminate().await;
                    break;
                }
                _ = sleep_until_deadline(deadline) => {
                    debug!("Terminating command on {} after deadline", session.describe());
                    timed_out = true;
                    channel.terminate().await;
                    break;
                }
                event = channel.next_event() => event,
            };

            match event {
                Some(ExecEvent::Output(bytes)) => {
                    let chunk = decoder.decode(&bytes);
                    self.capture(task_id, subtask_id, chunk, &mut buffer, &mut writer)
                        .await;
                }
                Some(ExecEvent::ExitStatus(code)) => {
                    exit_code = Some(code);
                }
                None => break,
            }
        }

        let tail = decoder.finish();
        self.capture(task_id, subtask_id, tail, &mut buffer, &mut writer)
            .await;
        writer.flush().await;

        Ok(RunOutcome {
            exit_code,
            truncated: buffer.is_truncated(),
            output: buffer.into_string(),
            cancelled: timed_out || cancel.is_cancelled(),
            timed_out,
        })
    }

    /// Forward a decoded chunk to the sink, the buffer and the store.
    async fn capture(
        &self,
        task_id: &str,
        subtask_id: &str,
        chunk: String,
        buffer: &mut OutputBuffer,
        writer: &mut ThrottledOutputWriter,
    ) {
        if chunk.is_empty() {
            return;
        }
        self.sink.emit(TaskEventEnvelope::new(
            task_id,
            TaskEvent::Log {
                subtask_id: subtask_id.to_string(),
                chunk: chunk.clone(),
            },
        ));
        buffer.push(&chunk);
        writer.push(&chunk).await;
    }
}

pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
