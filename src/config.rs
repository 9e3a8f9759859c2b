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

//! Engine configuration.
//!
//! Loaded from YAML; every field is optional and falls back to its default.
//!
//! ```yaml
//! connect_timeout: 15
//! server_alive_interval: 30
//! default_concurrency: 20
//! host_key_policy: known-hosts-file
//! known_hosts_file: ~/.ssh/fleet_known_hosts
//! ```

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::jump::DEFAULT_MAX_JUMP_HOPS;
use crate::shared::ConfigurationError;
use crate::ssh::{ServerCheckMethod, SshConnectionConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_MAX};

pub const DEFAULT_CONNECT_TIMEOUT: u64 = 30;
pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_OUTPUT_FLUSH_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// How server host keys are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept any host key.
    #[default]
    NoCheck,
    /// Check against `~/.ssh/known_hosts`.
    KnownHosts,
    /// Check against `known_hosts_file`.
    KnownHostsFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds allowed for each establishment step (TCP, proxy, handshake, auth, tunnel).
    pub connect_timeout: u64,
    /// Keepalive interval in seconds; 0 disables keepalive.
    pub server_alive_interval: u64,
    /// Unanswered keepalives before the session is considered dead.
    pub server_alive_count_max: usize,
    /// Concurrency limit for requests that do not set one.
    pub default_concurrency: usize,
    /// Cap on captured output per subtask, in bytes.
    pub max_output_bytes: usize,
    /// Minimum time between persisted output writes.
    pub output_flush_interval_ms: u64,
    pub max_jump_hops: usize,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_file: Option<PathBuf>,
    /// Age after which finished tasks are eligible for cleanup.
    pub retention_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            server_alive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            server_alive_count_max: DEFAULT_KEEPALIVE_MAX,
            default_concurrency: DEFAULT_CONCURRENCY,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            output_flush_interval_ms: DEFAULT_OUTPUT_FLUSH_INTERVAL_MS,
            max_jump_hops: DEFAULT_MAX_JUMP_HOPS,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_file: None,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl EngineConfig {
    /// `$XDG_CONFIG_HOME/fleetssh/config.yaml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "fleetssh").map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Load configuration from a file; a missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read configuration file at {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connect_timeout == 0 {
            return Err(ConfigurationError::invalid("connect_timeout", "must be at least 1 second"));
        }
        if self.default_concurrency == 0 {
            return Err(ConfigurationError::invalid("default_concurrency", "must be at least 1"));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigurationError::invalid("max_output_bytes", "must be at least 1"));
        }
        if self.max_jump_hops == 0 {
            return Err(ConfigurationError::invalid("max_jump_hops", "must be at least 1"));
        }
        if self.host_key_policy == HostKeyPolicy::KnownHostsFile && self.known_hosts_file.is_none() {
            return Err(ConfigurationError::invalid(
                "known_hosts_file",
                "required when host_key_policy is known-hosts-file",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn output_flush_interval(&self) -> Duration {
        Duration::from_millis(self.output_flush_interval_ms)
    }

    pub fn ssh_connection_config(&self) -> SshConnectionConfig {
        let interval = (self.server_alive_interval > 0).then_some(self.server_alive_interval);
        SshConnectionConfig::new()
            .with_keepalive_interval(interval)
            .with_keepalive_max(self.server_alive_count_max)
    }

    pub fn server_check_method(&self) -> ServerCheckMethod {
        match (self.host_key_policy, &self.known_hosts_file) {
            (HostKeyPolicy::NoCheck, _) => ServerCheckMethod::NoCheck,
            (HostKeyPolicy::KnownHosts, _) | (HostKeyPolicy::KnownHostsFile, None) => {
                ServerCheckMethod::DefaultKnownHostsFile
            }
            (HostKeyPolicy::KnownHostsFile, Some(path)) => {
                ServerCheckMethod::with_known_hosts_file(expand_tilde(path))
            }
        }
    }
}

/// Expand a leading `~/` to the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(dirs) = BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_concurrency, 10);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
        assert_eq!(config.max_jump_hops, 10);
        assert_eq!(config.server_check_method(), ServerCheckMethod::NoCheck);
        assert_eq!(config.ssh_connection_config(), SshConnectionConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str("connect_timeout: 5\nhost_key_policy: known-hosts\n").unwrap();
        assert_eq!(config.connect_timeout, 5);
        assert_eq!(config.default_concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.server_check_method(), ServerCheckMethod::DefaultKnownHostsFile);
    }

    #[test]
    fn test_zero_alive_interval_disables_keepalive() {
        let config = EngineConfig::from_yaml_str("server_alive_interval: 0").unwrap();
        assert_eq!(config.ssh_connection_config().keepalive_interval, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_yaml_str("default_concurrency: 0").is_err());
        assert!(EngineConfig::from_yaml_str("max_output_bytes: 0").is_err());
        assert!(EngineConfig::from_yaml_str("host_key_policy: known-hosts-file").is_err());
        assert!(EngineConfig::from_yaml_str("host_key_policy: sometimes").is_err());
    }

    #[test]
    fn test_known_hosts_file_policy() {
        let config = EngineConfig::from_yaml_str(
            "host_key_policy: known-hosts-file\nknown_hosts_file: /etc/ssh/fleet_known_hosts\n",
        )
        .unwrap();
        assert_eq!(
            config.server_check_method(),
            ServerCheckMethod::with_known_hosts_file("/etc/ssh/fleet_known_hosts")
        );
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(EngineConfig::from_yaml_str("").unwrap(), EngineConfig::default());
    }
}
