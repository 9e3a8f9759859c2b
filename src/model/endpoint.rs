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

//! Validated connection endpoints.
//!
//! Records coming from the credential resolver are loosely typed; this module
//! is where they are checked and turned into [`ConnectionEndpoint`]s. Every
//! rejection here is a [`ConfigurationError`], raised before any socket is
//! opened.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::session::resolver::{ProxyRecord, ResolvedConnection};
use crate::shared::ConfigurationError;
use crate::ssh::AuthMethod;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How a connection reaches its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    #[default]
    Direct,
    Proxy,
    Jump,
}

impl FromStr for RoutingMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "direct" => Ok(Self::Direct),
            "proxy" => Ok(Self::Proxy),
            "jump" | "jump-host" | "jumphost" => Ok(Self::Jump),
            other => Err(ConfigurationError::UnsupportedRoutingMode(other.to_string())),
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Proxy => "proxy",
            Self::Jump => "jump",
        })
    }
}

/// Supported proxy protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socks5 => "SOCKS5",
            Self::Http => "HTTP",
        }
    }
}

impl FromStr for ProxyKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socks5" | "socks" | "socks5h" => Ok(Self::Socks5),
            "http" | "https" | "http-connect" => Ok(Self::Http),
            other => Err(ConfigurationError::UnsupportedProxyType(other.to_string())),
        }
    }
}

/// A proxy the first TCP hop is routed through.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
}

impl ProxyDescriptor {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(Zeroizing::new(password.to_string()));
        self
    }

    /// Username/password pair, present only when both halves are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TryFrom<ProxyRecord> for ProxyDescriptor {
    type Error = ConfigurationError;

    fn try_from(record: ProxyRecord) -> Result<Self, Self::Error> {
        let kind = record.proxy_type.parse::<ProxyKind>()?;
        if record.host.trim().is_empty() {
            return Err(ConfigurationError::invalid("proxy host", "must not be empty"));
        }
        if record.port == 0 {
            return Err(ConfigurationError::invalid("proxy port", "must not be 0"));
        }
        Ok(Self {
            kind,
            host: record.host,
            port: record.port,
            username: record.username.filter(|u| !u.is_empty()),
            password: record.password,
        })
    }
}

/// A fully validated connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEndpoint {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub proxy: Option<ProxyDescriptor>,
    /// Ordered ids of the jump hosts to tunnel through.
    pub jump_chain: Vec<String>,
    pub routing_mode: RoutingMode,
}

impl ConnectionEndpoint {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port,
            username: username.into(),
            auth,
            proxy: None,
            jump_chain: Vec::new(),
            routing_mode: RoutingMode::Direct,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyDescriptor) -> Self {
        self.proxy = Some(proxy);
        self.routing_mode = RoutingMode::Proxy;
        self
    }

    pub fn with_jump_chain<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.jump_chain = chain.into_iter().map(Into::into).collect();
        self.routing_mode = RoutingMode::Jump;
        self
    }

    pub fn with_routing_mode(mut self, mode: RoutingMode) -> Self {
        self.routing_mode = mode;
        self
    }

    /// `user@host:port`
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Validate a resolver record.
    pub fn try_from_resolved(record: ResolvedConnection) -> Result<Self, ConfigurationError> {
        let ResolvedConnection {
            id,
            name,
            host,
            port,
            username,
            auth_method,
            password,
            private_key,
            passphrase,
            proxy,
            jump_chain,
            routing_mode,
        } = record;

        if host.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                format!("host of '{id}'"),
                "must not be empty",
            ));
        }
        if username.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                format!("username of '{id}'"),
                "must not be empty",
            ));
        }

        let auth = match auth_method.trim().to_ascii_lowercase().as_str() {
            "password" => {
                let password = password.ok_or_else(|| ConfigurationError::MissingCredential {
                    connection: id.clone(),
                    method: auth_method.clone(),
                    missing: "password",
                })?;
                AuthMethod::Password(password)
            }
            "key" | "private-key" | "privatekey" | "publickey" => {
                let key_data = private_key
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| ConfigurationError::MissingCredential {
                        connection: id.clone(),
                        method: auth_method.clone(),
                        missing: "private key",
                    })?;
                AuthMethod::PrivateKey {
                    key_data,
                    key_pass: passphrase.filter(|p| !p.is_empty()),
                }
            }
            _ => {
                return Err(ConfigurationError::UnsupportedAuthMethod {
                    connection: id,
                    method: auth_method,
                })
            }
        };

        let proxy = proxy.map(ProxyDescriptor::try_from).transpose()?;
        let routing_mode = routing_mode
            .as_deref()
            .map(str::parse::<RoutingMode>)
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            name: name.filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone()),
            id,
            host,
            port: port.unwrap_or(DEFAULT_SSH_PORT),
            username,
            auth,
            proxy,
            jump_chain: jump_chain.unwrap_or_default(),
            routing_mode,
        })
    }
}

/// One link of a jump chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpHop {
    /// Name used in logs and hop-indexed errors.
    pub name: String,
    pub endpoint: ConnectionEndpoint,
}

impl JumpHop {
    pub fn new(endpoint: ConnectionEndpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(auth_method: &str) -> ResolvedConnection {
        ResolvedConnection {
            id: "web-1".to_string(),
            host: "10.0.0.5".to_string(),
            username: "deploy".to_string(),
            auth_method: auth_method.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!("direct".parse::<RoutingMode>().unwrap(), RoutingMode::Direct);
        assert_eq!("PROXY".parse::<RoutingMode>().unwrap(), RoutingMode::Proxy);
        assert_eq!("jump".parse::<RoutingMode>().unwrap(), RoutingMode::Jump);
        assert!(matches!(
            "vpn".parse::<RoutingMode>(),
            Err(ConfigurationError::UnsupportedRoutingMode(_))
        ));
    }

    #[test]
    fn test_proxy_kind_parse() {
        assert_eq!("socks5".parse::<ProxyKind>().unwrap(), ProxyKind::Socks5);
        assert_eq!("HTTP".parse::<ProxyKind>().unwrap(), ProxyKind::Http);
        assert_eq!(
            "socks4".parse::<ProxyKind>(),
            Err(ConfigurationError::UnsupportedProxyType("socks4".to_string()))
        );
    }

    #[test]
    fn test_password_record_requires_password() {
        let err = ConnectionEndpoint::try_from_resolved(record("password")).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::MissingCredential {
                missing: "password",
                ..
            }
        ));

        let mut ok = record("password");
        ok.password = Some(Zeroizing::new("pw".to_string()));
        let endpoint = ConnectionEndpoint::try_from_resolved(ok).unwrap();
        assert_eq!(endpoint.port, DEFAULT_SSH_PORT);
        assert_eq!(endpoint.name, "web-1");
        assert_eq!(endpoint.routing_mode, RoutingMode::Direct);
        assert_eq!(endpoint.auth.kind(), "password");
    }

    #[test]
    fn test_key_record_requires_key() {
        let err = ConnectionEndpoint::try_from_resolved(record("key")).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::MissingCredential {
                missing: "private key",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_auth_method_rejected() {
        let err = ConnectionEndpoint::try_from_resolved(record("kerberos")).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnsupportedAuthMethod { .. }));
    }

    #[test]
    fn test_unsupported_proxy_type_rejected() {
        let mut rec = record("password");
        rec.password = Some(Zeroizing::new("pw".to_string()));
        rec.routing_mode = Some("proxy".to_string());
        rec.proxy = Some(ProxyRecord {
            proxy_type: "socks4".to_string(),
            host: "proxy.internal".to_string(),
            port: 1080,
            ..Default::default()
        });

        let err = ConnectionEndpoint::try_from_resolved(rec).unwrap_err();
        assert_eq!(err, ConfigurationError::UnsupportedProxyType("socks4".to_string()));
    }

    #[test]
    fn test_proxy_debug_redacts_password() {
        let proxy = ProxyDescriptor::new(ProxyKind::Http, "proxy", 3128).with_credentials("u", "topsecret");
        assert!(!format!("{proxy:?}").contains("topsecret"));
        assert_eq!(proxy.credentials(), Some(("u", "topsecret")));
    }

    #[test]
    fn test_builders_set_routing_mode() {
        let endpoint = ConnectionEndpoint::new("db", "db.internal", 22, "root", AuthMethod::with_password("x"))
            .with_jump_chain(["bastion"]);
        assert_eq!(endpoint.routing_mode, RoutingMode::Jump);
        assert_eq!(endpoint.jump_chain, vec!["bastion".to_string()]);
        assert_eq!(endpoint.address(), "root@db.internal:22");
    }
}
