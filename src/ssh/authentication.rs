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

//! SSH authentication methods and server key verification.

use russh::client::{Handle, Handler};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::shared::EstablishError;

/// Secret material used to authenticate one endpoint.
///
/// Secrets arrive already decrypted from the credential resolver and are
/// wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthMethod {
    Password(Zeroizing<String>),
    PrivateKey {
        /// entire contents of private key file
        key_data: Zeroizing<String>,
        key_pass: Option<Zeroizing<String>>,
    },
}

impl AuthMethod {
    pub fn with_password(password: &str) -> Self {
        Self::Password(Zeroizing::new(password.to_string()))
    }

    pub fn with_key(key: &str, passphrase: Option<&str>) -> Self {
        Self::PrivateKey {
            key_data: Zeroizing::new(key.to_string()),
            key_pass: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKey { .. } => "private-key",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey { key_pass, .. } => f
                .debug_struct("PrivateKey")
                .field("key_data", &"<redacted>")
                .field("has_passphrase", &key_pass.is_some())
                .finish(),
        }
    }
}

/// How the server's host key is verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ServerCheckMethod {
    NoCheck,
    /// base64 encoded key without the type prefix or hostname suffix (type is already encoded)
    PublicKey(String),
    DefaultKnownHostsFile,
    KnownHostsFile(PathBuf),
}

impl ServerCheckMethod {
    pub fn with_public_key(key: &str) -> Self {
        Self::PublicKey(key.to_string())
    }

    pub fn with_known_hosts_file(known_hosts_file: impl Into<PathBuf>) -> Self {
        Self::KnownHostsFile(known_hosts_file.into())
    }

    /// Verify `server_public_key` for `hostname:port`.
    pub(crate) fn verify(
        &self,
        hostname: &str,
        port: u16,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, russh::keys::Error> {
        match self {
            Self::NoCheck => Ok(true),
            Self::PublicKey(key) => {
                let pk = russh::keys::parse_public_key_base64(key)?;
                Ok(pk == *server_public_key)
            }
            Self::KnownHostsFile(path) => {
                russh::keys::check_known_hosts_path(hostname, port, server_public_key, path)
            }
            Self::DefaultKnownHostsFile => {
                russh::keys::check_known_hosts(hostname, port, server_public_key)
            }
        }
    }
}

/// Authenticate `handle` as `username`, mapping rejections to
/// [`EstablishError::Authentication`].
pub(crate) async fn authenticate<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    host: &str,
    auth: &AuthMethod,
) -> Result<(), EstablishError> {
    let rejected = |reason: &str| EstablishError::Authentication {
        user: username.to_string(),
        host: host.to_string(),
        reason: reason.to_string(),
    };
    let stage = format!("authenticating {username}@{host}");

    match auth {
        AuthMethod::Password(password) => {
            let result = handle
                .authenticate_password(username, password.as_str())
                .await
                .map_err(|e| EstablishError::ssh(&stage, e))?;
            if !result.success() {
                return Err(rejected("password rejected by server"));
            }
        }
        AuthMethod::PrivateKey { key_data, key_pass } => {
            let private_key =
                russh::keys::decode_secret_key(key_data, key_pass.as_ref().map(|p| p.as_str()))
                    .map_err(|e| rejected(&format!("failed to decode private key: {e}")))?;
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| EstablishError::ssh(&stage, e))?
                .flatten();
            let result = handle
                .authenticate_publickey(
                    username,
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(private_key), hash_alg),
                )
                .await
                .map_err(|e| EstablishError::ssh(&stage, e))?;
            if !result.success() {
                return Err(rejected("private key rejected by server"));
            }
        }
    }

    Ok(())
}
