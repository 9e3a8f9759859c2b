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

//! Per-connection SSH transport settings (keepalive).

use std::time::Duration;

/// Seconds between keepalive probes.
pub const DEFAULT_KEEPALIVE_INTERVAL: u64 = 60;

/// Unanswered keepalive probes tolerated before the transport is declared dead.
pub const DEFAULT_KEEPALIVE_MAX: usize = 3;

/// Settings applied to every SSH transport we open, including each hop of a jump chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConnectionConfig {
    /// Keepalive interval in seconds; `None` disables probing.
    pub keepalive_interval: Option<u64>,
    /// Missed probes before disconnect.
    pub keepalive_max: usize,
}

impl Default for SshConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
        }
    }
}

impl SshConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keepalive_interval(mut self, interval: Option<u64>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_keepalive_max(mut self, max: usize) -> Self {
        self.keepalive_max = max;
        self
    }

    /// Build the russh client configuration.
    ///
    /// A zero interval is treated as disabled.
    pub fn to_russh_config(&self) -> russh::client::Config {
        russh::client::Config {
            keepalive_interval: self
                .keepalive_interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}
