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

//! SOCKS5 client handshake (RFC 1928, RFC 1929 username/password).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::shared::TransportError;

const PROXY: &str = "SOCKS5";

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Human-readable text for a SOCKS5 reply code.
fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Ask the SOCKS5 proxy on `stream` to connect to `dest_host:dest_port`.
///
/// On success the stream is positioned at the start of the tunnelled bytes.
pub async fn handshake<S>(
    stream: &mut S,
    dest_host: &str,
    dest_port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let greeting: &[u8] = if credentials.is_some() {
        &[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[VERSION, 1, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(TransportError::negotiation(
            PROXY,
            format!("unexpected protocol version {:#04x}", choice[0]),
        ));
    }

    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some((username, password))) => {
            authenticate(stream, username, password).await?;
        }
        (METHOD_NONE_ACCEPTABLE, _) => {
            return Err(TransportError::negotiation(
                PROXY,
                "no acceptable authentication method",
            ))
        }
        (method, _) => {
            return Err(TransportError::negotiation(
                PROXY,
                format!("proxy selected unoffered method {method:#04x}"),
            ))
        }
    }

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    match dest_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = dest_host.as_bytes();
            let len = u8::try_from(name.len()).map_err(|_| {
                TransportError::negotiation(PROXY, "destination hostname longer than 255 bytes")
            })?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&dest_port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(TransportError::negotiation(
            PROXY,
            format!("unexpected reply version {:#04x}", header[0]),
        ));
    }
    if header[1] != 0x00 {
        return Err(TransportError::ProxyRejected {
            proxy: PROXY,
            target: format!("{dest_host}:{dest_port}"),
            reason: format!("{} (code {:#04x})", reply_reason(header[1]), header[1]),
        });
    }

    let bound = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        other => {
            return Err(TransportError::negotiation(
                PROXY,
                format!("unknown bound address type {other:#04x}"),
            ))
        }
    };
    let bound_port = stream.read_u16().await?;

    debug!("SOCKS5 tunnel to {dest_host}:{dest_port} established (bound {bound}:{bound_port})");
    Ok(())
}

/// Username/password sub-negotiation (RFC 1929).
async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = u8::try_from(username.len())
        .map_err(|_| TransportError::negotiation(PROXY, "username longer than 255 bytes"))?;
    let pass = u8::try_from(password.len())
        .map_err(|_| TransportError::negotiation(PROXY, "password longer than 255 bytes"))?;

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_VERSION);
    request.push(user);
    request.extend_from_slice(username.as_bytes());
    request.push(pass);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(TransportError::negotiation(
            PROXY,
            format!("username/password authentication rejected (status {:#04x})", reply[1]),
        ));
    }
    Ok(())
}
