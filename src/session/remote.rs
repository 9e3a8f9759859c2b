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

//! Abstractions over an authenticated session and a running remote command.
//!
//! The command runner and the orchestrator only see these traits, so the
//! russh-backed [`Client`](crate::ssh::Client) can be swapped for a scripted
//! session in tests.

use async_trait::async_trait;
use std::time::Duration;

use crate::shared::EstablishError;

/// One event read from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// A chunk of combined stdout/stderr.
    Output(Vec<u8>),
    /// The remote process reported its exit status.
    ExitStatus(u32),
}

/// A command running on a remote host.
#[async_trait]
pub trait ExecChannel: Send {
    /// Next output chunk or exit status; `None` once the channel is closed.
    async fn next_event(&mut self) -> Option<ExecEvent>;

    /// Ask the remote process to stop (TERM) and close the channel.
    async fn terminate(&mut self);
}

/// An authenticated session able to run commands.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Start `command_line` and return its output channel.
    async fn exec(&self, command_line: &str) -> anyhow::Result<Box<dyn ExecChannel>>;

    /// Close the session and every transport it depends on.
    async fn close(&self);

    /// `user@host:port` style description for logs.
    fn describe(&self) -> String;
}

/// Opens sessions to connections by id.
///
/// This is the seam the batch orchestrator depends on; the production
/// implementation is [`SessionEstablisher`](crate::session::SessionEstablisher).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        connection_id: &str,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, EstablishError>;
}
