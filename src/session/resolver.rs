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

//! Credential resolver interface.
//!
//! Credentials are stored and decrypted outside this crate. The resolver
//! hands back plaintext secrets wrapped in [`Zeroizing`] so they are wiped
//! once the session has been authenticated.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroizing;

/// A connection record as the credential store returns it.
///
/// Fields are loosely typed on purpose; validation happens in
/// [`ConnectionEndpoint::try_from_resolved`](crate::model::ConnectionEndpoint::try_from_resolved).
#[derive(Clone, Default)]
pub struct ResolvedConnection {
    pub id: String,
    pub name: Option<String>,
    pub host: String,
    /// Defaults to 22 when absent.
    pub port: Option<u16>,
    pub username: String,
    /// `password` or `key`
    pub auth_method: String,
    pub password: Option<Zeroizing<String>>,
    pub private_key: Option<Zeroizing<String>>,
    pub passphrase: Option<Zeroizing<String>>,
    pub proxy: Option<ProxyRecord>,
    pub jump_chain: Option<Vec<String>>,
    /// `direct`, `proxy` or `jump`; defaults to direct.
    pub routing_mode: Option<String>,
}

impl std::fmt::Debug for ResolvedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConnection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("proxy", &self.proxy.as_ref().map(|p| &p.proxy_type))
            .field("jump_chain", &self.jump_chain)
            .field("routing_mode", &self.routing_mode)
            .finish_non_exhaustive()
    }
}

/// Proxy settings attached to a resolved connection.
#[derive(Clone, Default)]
pub struct ProxyRecord {
    pub proxy_type: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
}

/// Maps connection ids to decrypted connection records.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Look up a connection; `Ok(None)` when the id is unknown.
    async fn resolve(&self, connection_id: &str) -> anyhow::Result<Option<ResolvedConnection>>;

    /// Record that a session to `connection_id` was just established.
    async fn record_last_used(&self, connection_id: &str) -> anyhow::Result<()>;
}

/// Resolver over a fixed set of records.
///
/// Useful for embedding and for tests; last-used notifications are counted.
#[derive(Debug, Default)]
pub struct StaticCredentialResolver {
    records: HashMap<String, ResolvedConnection>,
    last_used: Mutex<HashMap<String, usize>>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(mut self, record: ResolvedConnection) -> Self {
        self.insert(record);
        self
    }

    pub fn insert(&mut self, record: ResolvedConnection) {
        self.records.insert(record.id.clone(), record);
    }

    /// How many times `connection_id` was reported as used.
    pub fn last_used_count(&self, connection_id: &str) -> usize {
        self.last_used
            .lock()
            .map(|m| m.get(connection_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, connection_id: &str) -> anyhow::Result<Option<ResolvedConnection>> {
        Ok(self.records.get(connection_id).cloned())
    }

    async fn record_last_used(&self, connection_id: &str) -> anyhow::Result<()> {
        let mut last_used = self
            .last_used
            .lock()
            .map_err(|_| anyhow::anyhow!("last-used map poisoned"))?;
        *last_used.entry(connection_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_lookup() {
        let resolver = StaticCredentialResolver::new().with_connection(ResolvedConnection {
            id: "web".to_string(),
            host: "10.0.0.1".to_string(),
            username: "ops".to_string(),
            auth_method: "password".to_string(),
            password: Some(Zeroizing::new("pw".to_string())),
            ..Default::default()
        });

        assert!(resolver.resolve("web").await.unwrap().is_some());
        assert!(resolver.resolve("db").await.unwrap().is_none());

        resolver.record_last_used("web").await.unwrap();
        resolver.record_last_used("web").await.unwrap();
        assert_eq!(resolver.last_used_count("web"), 2);
        assert_eq!(resolver.last_used_count("db"), 0);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let record = ResolvedConnection {
            id: "web".to_string(),
            password: Some(Zeroizing::new("hunter2".to_string())),
            private_key: Some(Zeroizing::new("-----BEGIN".to_string())),
            ..Default::default()
        };
        let rendered = format!("{record:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("BEGIN"));
    }
}
