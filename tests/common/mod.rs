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

//! Scripted sessions and a recording sink for orchestrator tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetssh::executor::EventSink;
use fleetssh::model::TaskEventEnvelope;
use fleetssh::session::{Connector, ExecChannel, ExecEvent, RemoteSession};
use fleetssh::shared::EstablishError;

/// What a scripted host does when a command runs on it.
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    /// Output chunks sent before the delay.
    pub output: Vec<String>,
    /// How long the command runs after its output.
    pub delay: Duration,
    /// `None` closes the channel without an exit status.
    pub exit_code: Option<u32>,
    /// Refuse the connection instead of running anything.
    pub refuse: bool,
    /// How long closing the session takes.
    pub close_delay: Duration,
}

impl HostScript {
    pub fn exits(code: u32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn with_output(mut self, chunk: &str) -> Self {
        self.output.push(chunk.to_string());
        self
    }

    pub fn refused() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct Activity {
    active: AtomicUsize,
    peak: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

/// Connector handing out scripted sessions, keyed by connection id.
///
/// Unknown ids run `exit 0` immediately.
#[derive(Debug, Default)]
pub struct MockConnector {
    scripts: HashMap<String, HostScript>,
    activity: Arc<Activity>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, connection_id: &str, script: HostScript) -> Self {
        self.scripts.insert(connection_id.to_string(), script);
        self
    }

    /// Most sessions open at the same time.
    pub fn peak_active(&self) -> usize {
        self.activity.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.activity.active.load(Ordering::SeqCst)
    }

    /// Command lines executed so far, in start order.
    pub fn commands(&self) -> Vec<String> {
        self.activity.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        connection_id: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, EstablishError> {
        let script = self
            .scripts
            .get(connection_id)
            .cloned()
            .unwrap_or_else(|| HostScript::exits(0));

        if script.refuse {
            return Err(EstablishError::Authentication {
                user: "ops".to_string(),
                host: connection_id.to_string(),
                reason: "permission denied".to_string(),
            });
        }

        let now = self.activity.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.activity.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(MockSession {
            connection_id: connection_id.to_string(),
            script,
            activity: Arc::clone(&self.activity),
        }))
    }
}

struct MockSession {
    connection_id: String,
    script: HostScript,
    activity: Arc<Activity>,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.activity.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command_line: &str) -> anyhow::Result<Box<dyn ExecChannel>> {
        self.activity
            .commands
            .lock()
            .unwrap()
            .push(command_line.to_string());
        Ok(Box::new(MockChannel {
            output: self.script.output.iter().cloned().collect(),
            delay: Some(self.script.delay),
            exit_code: self.script.exit_code,
            terminated: false,
        }))
    }

    async fn close(&self) {
        tokio::time::sleep(self.script.close_delay).await;
    }

    fn describe(&self) -> String {
        format!("ops@{}:22", self.connection_id)
    }
}

struct MockChannel {
    output: VecDeque<String>,
    delay: Option<Duration>,
    exit_code: Option<u32>,
    terminated: bool,
}

#[async_trait]
impl ExecChannel for MockChannel {
    async fn next_event(&mut self) -> Option<ExecEvent> {
        if self.terminated {
            return None;
        }
        if let Some(chunk) = self.output.pop_front() {
            return Some(ExecEvent::Output(chunk.into_bytes()));
        }
        if let Some(delay) = self.delay.take() {
            tokio::time::sleep(delay).await;
        }
        self.exit_code.take().map(ExecEvent::ExitStatus)
    }

    async fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Sink that keeps every event for inspection.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<TaskEventEnvelope>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    /// Event type names, excluding `log`.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|e| e.event.kind())
            .filter(|kind| *kind != "log")
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: TaskEventEnvelope) {
        self.events.lock().unwrap().push(event);
    }
}
