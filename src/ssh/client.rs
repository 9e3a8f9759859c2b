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

//! Authenticated SSH client over an arbitrary byte stream.
//!
//! The stream may be a plain TCP socket, a socket handed over by a proxy, or
//! a `direct-tcpip` channel of a jump host. Each establishment step runs under
//! its own timeout.

use russh::client::{Handle, Handler};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::authentication::{authenticate, ServerCheckMethod};
use super::config::SshConnectionConfig;
use crate::model::ConnectionEndpoint;
use crate::shared::EstablishError;

/// Errors raised inside the russh handler callbacks.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("host key verification failed: {0}")]
    ServerCheck(#[from] russh::keys::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// An authenticated SSH session.
///
/// When the session was reached through jump hosts, the hop sessions are
/// owned here so the tunnel stays open for as long as the client lives.
pub struct Client {
    handle: Arc<Handle<ClientHandler>>,
    username: String,
    host: String,
    port: u16,
    hops: Vec<Client>,
}

impl Client {
    /// Run the SSH handshake and authentication for `endpoint` over `stream`.
    pub async fn connect_stream<S>(
        stream: S,
        endpoint: &ConnectionEndpoint,
        server_check: ServerCheckMethod,
        ssh_config: &SshConnectionConfig,
        step_timeout: Duration,
    ) -> Result<Self, EstablishError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let target = format!("{}:{}", endpoint.host, endpoint.port);
        let handler = ClientHandler::new(endpoint.host.clone(), endpoint.port, server_check);
        let config = Arc::new(ssh_config.to_russh_config());

        debug!("Starting SSH handshake with {target}");
        let stage = format!("performing SSH handshake with {target}");
        let mut handle = tokio::time::timeout(
            step_timeout,
            russh::client::connect_stream(config, stream, handler),
        )
        .await
        .map_err(|_| EstablishError::timeout(&stage, step_timeout))?
        .map_err(|e| EstablishError::ssh(&stage, e))?;

        debug!("Authenticating {} with {} auth", endpoint.address(), endpoint.auth.kind());
        tokio::time::timeout(
            step_timeout,
            authenticate(&mut handle, &endpoint.username, &endpoint.host, &endpoint.auth),
        )
        .await
        .map_err(|_| {
            EstablishError::timeout(format!("authenticating to {target}"), step_timeout)
        })??;

        Ok(Self {
            handle: Arc::new(handle),
            username: endpoint.username.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            hops: Vec::new(),
        })
    }

    /// Attach the hop sessions this client is tunnelled through.
    pub(crate) fn with_hops(mut self, hops: Vec<Client>) -> Self {
        self.hops = hops;
        self
    }

    pub(crate) fn handle(&self) -> &Handle<ClientHandler> {
        &self.handle
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of jump hosts between us and this session.
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Disconnect this session only, leaving any hops untouched.
    pub async fn disconnect(&self) -> Result<(), russh::Error> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
    }

    /// Disconnect this session, then its hops innermost first.
    pub async fn close(&self) {
        if let Err(e) = self.disconnect().await {
            debug!("Disconnect from {}:{} failed: {e}", self.host, self.port);
        }
        crate::jump::close_hops(&self.hops).await;
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("username", &self.username)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("hops", &self.hops.len())
            .field("handle", &"Handle<ClientHandler>")
            .finish()
    }
}

/// russh handler that verifies the server host key.
///
/// The hostname is kept as given so hosts that are only reachable through a
/// tunnel never need local DNS resolution.
#[derive(Debug, Clone)]
pub struct ClientHandler {
    hostname: String,
    port: u16,
    server_check: ServerCheckMethod,
}

impl ClientHandler {
    pub fn new(hostname: String, port: u16, server_check: ServerCheckMethod) -> Self {
        Self {
            hostname,
            port,
            server_check,
        }
    }
}

impl Handler for ClientHandler {
    type Error = HandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self
            .server_check
            .verify(&self.hostname, self.port, server_public_key)?;
        if !accepted {
            debug!(
                "Host key for {}:{} did not match {:?}",
                self.hostname, self.port, self.server_check
            );
        }
        Ok(accepted)
    }
}
