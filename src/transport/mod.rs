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

//! Raw byte streams to a destination, optionally through a proxy.

pub mod http_connect;
pub mod socks5;

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::model::{ProxyDescriptor, ProxyKind};
use crate::shared::{EstablishError, TransportError};

/// Open a TCP stream that ends at `dest_host:dest_port`.
///
/// With a proxy, the TCP connection goes to the proxy and the proxy is asked
/// to tunnel to the destination. The whole operation is bounded by
/// `timeout`; on expiry the socket is dropped.
pub async fn build_transport(
    dest_host: &str,
    dest_port: u16,
    proxy: Option<&ProxyDescriptor>,
    timeout: Duration,
) -> Result<TcpStream, EstablishError> {
    let stage = match proxy {
        Some(p) => format!(
            "connecting to {dest_host}:{dest_port} through {} proxy {}:{}",
            p.kind.as_str(),
            p.host,
            p.port
        ),
        None => format!("connecting to {dest_host}:{dest_port}"),
    };

    tokio::time::timeout(timeout, open(dest_host, dest_port, proxy))
        .await
        .map_err(|_| EstablishError::timeout(stage, timeout))?
        .map_err(EstablishError::from)
}

async fn open(
    dest_host: &str,
    dest_port: u16,
    proxy: Option<&ProxyDescriptor>,
) -> Result<TcpStream, TransportError> {
    let Some(proxy) = proxy else {
        debug!("Connecting directly to {dest_host}:{dest_port}");
        return connect_tcp(dest_host, dest_port).await;
    };

    debug!(
        "Connecting to {dest_host}:{dest_port} via {} proxy {}:{}",
        proxy.kind.as_str(),
        proxy.host,
        proxy.port
    );
    let mut stream = connect_tcp(&proxy.host, proxy.port).await?;
    match proxy.kind {
        ProxyKind::Socks5 => {
            socks5::handshake(&mut stream, dest_host, dest_port, proxy.credentials()).await?
        }
        ProxyKind::Http => {
            http_connect::handshake(&mut stream, dest_host, dest_port, proxy.credentials()).await?
        }
    }
    Ok(stream)
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|source| TransportError::Connect {
            addr: format!("{host}:{port}"),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {host}:{port}: {e}");
    }
    Ok(stream)
}
