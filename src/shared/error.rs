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

//! Error taxonomy shared by session establishment and task orchestration.
//!
//! # Error Categories
//!
//! - [`ConfigurationError`]: rejected before any network I/O, never retried
//! - [`TransportError`]: proxy negotiation or TCP failures
//! - [`EstablishError`]: everything that can go wrong while building a session
//! - [`TaskError`]: invalid batch requests and store failures

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Problems with the shape of a connection or request.
///
/// These are detected while resolving credentials and jump chains, so they
/// always surface before a socket is opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The credential resolver has no record for this connection id.
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    /// The jump chain of a connection lists the connection itself.
    #[error("jump chain of '{0}' references the target connection itself")]
    SelfReferencingJumpChain(String),

    /// A hop in the chain declares a jump chain of its own.
    #[error("jump host '{hop}' declares its own jump chain; nested chains are not supported")]
    NestedJumpChain { hop: String },

    /// The same hop appears more than once in a chain.
    #[error("jump host '{hop}' appears more than once in the chain")]
    DuplicateJumpHost { hop: String },

    /// The chain is longer than the configured limit.
    #[error("jump chain has {len} hops, exceeding the maximum of {max}")]
    JumpChainTooLong { len: usize, max: usize },

    /// The auth method requires secret material that was not supplied.
    #[error("connection '{connection}' uses {method} authentication but no {missing} was provided")]
    MissingCredential {
        connection: String,
        method: String,
        missing: &'static str,
    },

    /// The auth method name is not one we can use.
    #[error("connection '{connection}' uses unsupported authentication method '{method}'")]
    UnsupportedAuthMethod { connection: String, method: String },

    /// The proxy type is neither SOCKS5 nor HTTP.
    #[error("unsupported proxy type '{0}' (expected socks5 or http)")]
    UnsupportedProxyType(String),

    /// The routing mode name is not one we know.
    #[error("unsupported routing mode '{0}' (expected direct, proxy or jump)")]
    UnsupportedRoutingMode(String),

    /// A field failed validation.
    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigurationError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures while opening the raw byte stream to a host or proxy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connect to the destination (or the proxy) failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The proxy spoke a protocol we did not expect.
    #[error("{proxy} proxy negotiation failed: {reason}")]
    ProxyNegotiation { proxy: &'static str, reason: String },

    /// The proxy refused the tunnel request.
    #[error("{proxy} proxy refused connection to {target}: {reason}")]
    ProxyRejected {
        proxy: &'static str,
        target: String,
        reason: String,
    },

    /// Socket error after the connection was up.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn negotiation(proxy: &'static str, reason: impl Into<String>) -> Self {
        Self::ProxyNegotiation {
            proxy,
            reason: reason.into(),
        }
    }
}

/// Everything that can prevent an authenticated session from being built.
#[derive(Debug, Error)]
pub enum EstablishError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The remote host rejected our credentials (or the key could not be used).
    #[error("authentication failed for {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    /// An establishment step did not finish in time.
    #[error("timed out after {}s while {stage}", .after.as_secs_f64())]
    Timeout { stage: String, after: Duration },

    /// SSH protocol failure (handshake, host key check, channel open).
    #[error("SSH error while {stage}: {message}")]
    Ssh { stage: String, message: String },

    /// The credential resolver itself failed.
    #[error("credential resolution failed: {0:#}")]
    Resolver(anyhow::Error),

    /// A jump hop failed; wraps the underlying error with the hop position.
    #[error("jump host #{index} ({name}): {source}")]
    Hop {
        index: usize,
        name: String,
        #[source]
        source: Box<EstablishError>,
    },
}

impl EstablishError {
    pub(crate) fn timeout(stage: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            stage: stage.into(),
            after,
        }
    }

    pub(crate) fn ssh(stage: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Ssh {
            stage: stage.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn at_hop(self, index: usize, name: &str) -> Self {
        Self::Hop {
            index,
            name: name.to_string(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through hop wrappers.
    pub fn root(&self) -> &EstablishError {
        match self {
            Self::Hop { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), Self::Configuration(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.root(), Self::Transport(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self.root(), Self::Authentication { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }
}

/// Errors from creating, running and managing batch tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("task '{0}' is already running")]
    AlreadyRunning(String),

    /// The spawned run ended without producing a result.
    #[error("task run aborted: {0}")]
    Aborted(String),

    #[error("task store error: {0:#}")]
    Store(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = ConfigurationError::SelfReferencingJumpChain("db-1".to_string());
        assert!(err.to_string().contains("db-1"));

        let err = ConfigurationError::UnsupportedProxyType("socks4".to_string());
        assert!(err.to_string().contains("socks4"));

        let err = ConfigurationError::MissingCredential {
            connection: "web".to_string(),
            method: "password".to_string(),
            missing: "password",
        };
        assert!(err.to_string().contains("no password"));
    }

    #[test]
    fn test_hop_wrapping_keeps_category() {
        let inner = EstablishError::Authentication {
            user: "ops".to_string(),
            host: "bastion".to_string(),
            reason: "password rejected".to_string(),
        };
        let wrapped = inner.at_hop(1, "bastion");

        assert!(wrapped.is_authentication());
        assert!(!wrapped.is_configuration());
        assert!(wrapped.to_string().contains("jump host #1 (bastion)"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let err = EstablishError::from(TransportError::from(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(err.is_transport());
        assert!(err.to_string().contains("reset"));
    }

    #[test]
    fn test_timeout_display() {
        let err = EstablishError::timeout("connecting to 10.0.0.1:22", Duration::from_secs(5));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out after 5s"));
    }
}
