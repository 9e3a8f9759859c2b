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

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use fleetssh::config::HostKeyPolicy;
use fleetssh::ssh::ServerCheckMethod;
use fleetssh::EngineConfig;

#[tokio::test]
async fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
connect_timeout: 15
server_alive_interval: 0
default_concurrency: 4
max_output_bytes: 4096
host_key_policy: known-hosts-file
known_hosts_file: /etc/fleet/known_hosts
retention_days: 7
"#
    )
    .unwrap();

    let config = EngineConfig::load(file.path()).await.unwrap();
    assert_eq!(config.connect_timeout(), Duration::from_secs(15));
    assert_eq!(config.default_concurrency, 4);
    assert_eq!(config.max_output_bytes, 4096);
    assert_eq!(config.retention_days, 7);
    assert_eq!(config.host_key_policy, HostKeyPolicy::KnownHostsFile);
    assert!(matches!(
        config.server_check_method(),
        ServerCheckMethod::KnownHostsFile(_)
    ));
    // Keepalive disabled.
    assert_eq!(config.ssh_connection_config().keepalive_interval, None);

    // Unset fields keep their defaults.
    assert_eq!(config.max_jump_hops, 10);
    assert_eq!(config.output_flush_interval(), Duration::from_millis(500));
}

#[tokio::test]
async fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::load(&dir.path().join("absent.yaml")).await.unwrap();
    assert_eq!(config, EngineConfig::default());
}

#[tokio::test]
async fn test_invalid_file_reports_path() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "default_concurrency: 0").unwrap();

    let err = EngineConfig::load(file.path()).await.unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains(&file.path().display().to_string()), "{message}");
    assert!(message.contains("default_concurrency"), "{message}");
}
