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

//! HTTP `CONNECT` tunnelling.

use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::shared::TransportError;

const PROXY: &str = "HTTP";

/// Largest response head we accept from the proxy.
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Format the authority part of the request line; IPv6 literals are bracketed.
fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Issue `CONNECT dest_host:dest_port` on `stream` and wait for a 200 reply.
///
/// The response head is read one byte at a time so bytes the destination
/// sends right after the reply stay in the stream.
pub async fn handshake<S>(
    stream: &mut S,
    dest_host: &str,
    dest_port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = authority(dest_host, dest_port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((username, password)) = credentials {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = parse_status(status_line)?;
    if status != 200 {
        return Err(TransportError::ProxyRejected {
            proxy: PROXY,
            target,
            reason: status_line.trim().to_string(),
        });
    }

    debug!("HTTP CONNECT tunnel to {target} established");
    Ok(())
}

async fn read_response_head<S>(stream: &mut S) -> Result<String, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::negotiation(
                PROXY,
                format!("response head exceeds {MAX_RESPONSE_HEAD} bytes"),
            ));
        }
        match stream.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::negotiation(
                    PROXY,
                    "proxy closed the connection before completing its response",
                ))
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// `HTTP/1.1 200 Connection established` -> 200
fn parse_status(status_line: &str) -> Result<u16, TransportError> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransportError::negotiation(
            PROXY,
            format!("malformed status line '{}'", status_line.trim()),
        ));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            TransportError::negotiation(PROXY, format!("malformed status line '{}'", status_line.trim()))
        })
}
