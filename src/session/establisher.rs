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

//! Session establishment: direct, proxied or through jump hosts.
//!
//! Establishment happens in two phases. [`SessionEstablisher::plan_route`]
//! resolves and validates everything the connection needs (credentials, proxy,
//! every jump hop) without touching the network, so configuration errors are
//! always reported before a socket is opened. The chosen [`Route`] is then
//! connected and authenticated.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::remote::{Connector, RemoteSession};
use super::resolver::CredentialResolver;
use crate::config::EngineConfig;
use crate::jump::{ensure_not_nested, resolve_chain, validate_chain, DEFAULT_MAX_JUMP_HOPS};
use crate::model::{ConnectionEndpoint, JumpHop, ProxyDescriptor, RoutingMode};
use crate::shared::{ConfigurationError, EstablishError};
use crate::ssh::{Client, ServerCheckMethod, SshConnectionConfig};
use crate::transport::build_transport;

/// How a session will be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy(ProxyDescriptor),
    Jump(Vec<JumpHop>),
}

impl Route {
    pub fn mode(&self) -> RoutingMode {
        match self {
            Self::Direct => RoutingMode::Direct,
            Self::Proxy(_) => RoutingMode::Proxy,
            Self::Jump(_) => RoutingMode::Jump,
        }
    }
}

/// The routing mode that will actually be used for `endpoint`.
///
/// `proxy` without a proxy descriptor and `jump` without a chain fall back to
/// `direct` with a warning.
pub fn effective_routing_mode(endpoint: &ConnectionEndpoint) -> RoutingMode {
    match endpoint.routing_mode {
        RoutingMode::Direct => RoutingMode::Direct,
        RoutingMode::Proxy if endpoint.proxy.is_some() => RoutingMode::Proxy,
        RoutingMode::Proxy => {
            warn!(
                "Connection '{}' uses proxy routing but has no proxy configured; connecting directly",
                endpoint.id
            );
            RoutingMode::Direct
        }
        RoutingMode::Jump if !endpoint.jump_chain.is_empty() => RoutingMode::Jump,
        RoutingMode::Jump => {
            warn!(
                "Connection '{}' uses jump routing but has no jump hosts configured; connecting directly",
                endpoint.id
            );
            RoutingMode::Direct
        }
    }
}

/// Builds authenticated sessions from connection ids.
pub struct SessionEstablisher {
    resolver: Arc<dyn CredentialResolver>,
    server_check: ServerCheckMethod,
    ssh_config: SshConnectionConfig,
    max_jump_hops: usize,
}

impl SessionEstablisher {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            resolver,
            server_check: ServerCheckMethod::NoCheck,
            ssh_config: SshConnectionConfig::default(),
            max_jump_hops: DEFAULT_MAX_JUMP_HOPS,
        }
    }

    /// Establisher using the host key policy, keepalive and hop limit from `config`.
    pub fn from_config(resolver: Arc<dyn CredentialResolver>, config: &EngineConfig) -> Self {
        Self {
            resolver,
            server_check: config.server_check_method(),
            ssh_config: config.ssh_connection_config(),
            max_jump_hops: config.max_jump_hops,
        }
    }

    pub fn with_server_check(mut self, server_check: ServerCheckMethod) -> Self {
        self.server_check = server_check;
        self
    }

    pub fn with_ssh_config(mut self, ssh_config: SshConnectionConfig) -> Self {
        self.ssh_config = ssh_config;
        self
    }

    pub fn with_max_jump_hops(mut self, max: usize) -> Self {
        self.max_jump_hops = max;
        self
    }

    /// Look up and validate one connection.
    pub async fn resolve_endpoint(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionEndpoint, EstablishError> {
        let record = self
            .resolver
            .resolve(connection_id)
            .await
            .map_err(EstablishError::Resolver)?
            .ok_or_else(|| ConfigurationError::UnknownConnection(connection_id.to_string()))?;
        Ok(ConnectionEndpoint::try_from_resolved(record)?)
    }

    /// Decide how `endpoint` will be reached and resolve everything that needs.
    ///
    /// Never performs network I/O. A declared jump chain is validated
    /// whatever the routing mode.
    pub async fn plan_route(&self, endpoint: &ConnectionEndpoint) -> Result<Route, EstablishError> {
        validate_chain(endpoint, self.max_jump_hops)?;
        match effective_routing_mode(endpoint) {
            RoutingMode::Direct => Ok(Route::Direct),
            RoutingMode::Proxy => match &endpoint.proxy {
                Some(proxy) => Ok(Route::Proxy(proxy.clone())),
                None => Ok(Route::Direct),
            },
            RoutingMode::Jump => {
                let mut hops = Vec::with_capacity(endpoint.jump_chain.len());
                for hop_id in &endpoint.jump_chain {
                    let hop = self.resolve_endpoint(hop_id).await?;
                    ensure_not_nested(&hop)?;
                    hops.push(JumpHop::new(hop));
                }
                Ok(Route::Jump(hops))
            }
        }
    }

    /// Connect and authenticate `endpoint` over a planned route.
    ///
    /// `timeout` bounds every individual network step.
    pub async fn connect_route(
        &self,
        endpoint: &ConnectionEndpoint,
        route: &Route,
        timeout: Duration,
    ) -> Result<Client, EstablishError> {
        debug!("Connecting to {} via {} route", endpoint.address(), route.mode());
        match route {
            Route::Direct => self.connect_stream(endpoint, None, timeout).await,
            Route::Proxy(proxy) => self.connect_stream(endpoint, Some(proxy), timeout).await,
            Route::Jump(hops) => {
                resolve_chain(hops, endpoint, &self.server_check, &self.ssh_config, timeout).await
            }
        }
    }

    async fn connect_stream(
        &self,
        endpoint: &ConnectionEndpoint,
        proxy: Option<&ProxyDescriptor>,
        timeout: Duration,
    ) -> Result<Client, EstablishError> {
        let stream = build_transport(&endpoint.host, endpoint.port, proxy, timeout).await?;
        Client::connect_stream(
            stream,
            endpoint,
            self.server_check.clone(),
            &self.ssh_config,
            timeout,
        )
        .await
    }

    /// Plan, connect and authenticate `endpoint`.
    ///
    /// On success the resolver is told the connection was used; that
    /// notification runs in the background and its failure is only logged.
    pub async fn establish_session(
        &self,
        endpoint: &ConnectionEndpoint,
        timeout: Duration,
    ) -> Result<Client, EstablishError> {
        let route = self.plan_route(endpoint).await?;
        let client = self.connect_route(endpoint, &route, timeout).await?;

        info!(
            "SSH session established to {} ({}, {} hop(s))",
            endpoint.address(),
            route.mode(),
            client.hop_count()
        );
        self.spawn_record_last_used(&endpoint.id);
        Ok(client)
    }

    fn spawn_record_last_used(&self, connection_id: &str) {
        let resolver = Arc::clone(&self.resolver);
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = resolver.record_last_used(&connection_id).await {
                warn!("Failed to record last use of connection '{connection_id}': {e:#}");
            }
        });
    }
}

#[async_trait]
impl Connector for SessionEstablisher {
    async fn connect(
        &self,
        connection_id: &str,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, EstablishError> {
        let endpoint = self.resolve_endpoint(connection_id).await?;
        let client = self.establish_session(&endpoint, timeout).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProxyKind;
    use crate::session::resolver::{ResolvedConnection, StaticCredentialResolver};
    use crate::ssh::AuthMethod;
    use zeroize::Zeroizing;

    fn record(id: &str) -> ResolvedConnection {
        ResolvedConnection {
            id: id.to_string(),
            host: format!("{id}.internal"),
            username: "ops".to_string(),
            auth_method: "password".to_string(),
            password: Some(Zeroizing::new("pw".to_string())),
            ..Default::default()
        }
    }

    fn endpoint(id: &str) -> ConnectionEndpoint {
        ConnectionEndpoint::new(id, format!("{id}.internal"), 22, "ops", AuthMethod::with_password("pw"))
    }

    #[test]
    fn test_routing_fallbacks() {
        assert_eq!(effective_routing_mode(&endpoint("a")), RoutingMode::Direct);

        let proxy_without_descriptor = endpoint("a").with_routing_mode(RoutingMode::Proxy);
        assert_eq!(effective_routing_mode(&proxy_without_descriptor), RoutingMode::Direct);

        let jump_without_chain = endpoint("a").with_routing_mode(RoutingMode::Jump);
        assert_eq!(effective_routing_mode(&jump_without_chain), RoutingMode::Direct);

        let proxied = endpoint("a").with_proxy(ProxyDescriptor::new(ProxyKind::Socks5, "p", 1080));
        assert_eq!(effective_routing_mode(&proxied), RoutingMode::Proxy);

        // a proxy descriptor is ignored unless the mode asks for it
        let direct_with_proxy = proxied.clone().with_routing_mode(RoutingMode::Direct);
        assert_eq!(effective_routing_mode(&direct_with_proxy), RoutingMode::Direct);
    }

    #[tokio::test]
    async fn test_plan_route_resolves_hops_in_order() {
        let resolver = StaticCredentialResolver::new()
            .with_connection(record("edge"))
            .with_connection(record("bastion"));
        let establisher = SessionEstablisher::new(Arc::new(resolver));

        let target = endpoint("db").with_jump_chain(["edge", "bastion"]);
        let route = establisher.plan_route(&target).await.unwrap();
        match route {
            Route::Jump(hops) => {
                let names: Vec<_> = hops.iter().map(|h| h.name.as_str()).collect();
                assert_eq!(names, ["edge", "bastion"]);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plan_route_rejects_unknown_and_nested_hops() {
        let mut nested = record("bastion");
        nested.jump_chain = Some(vec!["edge".to_string()]);
        let resolver = StaticCredentialResolver::new().with_connection(nested);
        let establisher = SessionEstablisher::new(Arc::new(resolver));

        let err = establisher
            .plan_route(&endpoint("db").with_jump_chain(["bastion"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EstablishError::Configuration(ConfigurationError::NestedJumpChain { .. })
        ));

        let err = establisher
            .plan_route(&endpoint("db").with_jump_chain(["missing"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EstablishError::Configuration(ConfigurationError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_hop_limit_from_builder() {
        let establisher =
            SessionEstablisher::new(Arc::new(StaticCredentialResolver::new())).with_max_jump_hops(1);
        let err = establisher
            .plan_route(&endpoint("db").with_jump_chain(["a", "b"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EstablishError::Configuration(ConfigurationError::JumpChainTooLong { len: 2, max: 1 })
        ));
    }
}
