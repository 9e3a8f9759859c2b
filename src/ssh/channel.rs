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

//! Channel operations: forwarding and command execution.

use anyhow::Context;
use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tracing::debug;

use super::client::Client;
use crate::session::remote::{ExecChannel, ExecEvent, RemoteSession};

/// Originator reported in `direct-tcpip` requests.
const ORIGINATOR_ADDRESS: &str = "127.0.0.1";
const ORIGINATOR_PORT: u32 = 22;

impl Client {
    /// Open a `direct-tcpip` channel from this session to `host:port`.
    ///
    /// The host is resolved by the remote side, not locally.
    pub async fn open_direct_tcpip_channel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.handle()
            .channel_open_direct_tcpip(
                host.to_string(),
                u32::from(port),
                ORIGINATOR_ADDRESS.to_string(),
                ORIGINATOR_PORT,
            )
            .await
    }
}

/// A command started with `exec` on a session channel.
pub struct SshExecChannel {
    channel: Channel<Msg>,
}

impl SshExecChannel {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn next_event(&mut self) -> Option<ExecEvent> {
        // The exit status may arrive before the last data packets, so keep
        // reading until the channel itself is gone.
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => return Some(ExecEvent::Output(data.to_vec())),
                ChannelMsg::ExtendedData { data, .. } => {
                    return Some(ExecEvent::Output(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ExecEvent::ExitStatus(exit_status))
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    debug!("Remote process killed by signal {signal_name:?}");
                }
                _ => {}
            }
        }
        None
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.channel.signal(Sig::TERM).await {
            debug!("Failed to send TERM to remote process: {e}");
        }
        if let Err(e) = self.channel.close().await {
            debug!("Failed to close exec channel: {e}");
        }
    }
}

#[async_trait]
impl RemoteSession for Client {
    async fn exec(&self, command_line: &str) -> anyhow::Result<Box<dyn ExecChannel>> {
        let channel = self
            .handle()
            .channel_open_session()
            .await
            .with_context(|| format!("Failed to open session channel on {}", self.describe()))?;
        channel
            .exec(true, command_line)
            .await
            .with_context(|| format!("Failed to start command on {}", self.describe()))?;
        Ok(Box::new(SshExecChannel::new(channel)))
    }

    async fn close(&self) {
        Client::close(self).await;
    }

    fn describe(&self) -> String {
        format!("{}@{}:{}", self.username(), self.host(), self.port())
    }
}
