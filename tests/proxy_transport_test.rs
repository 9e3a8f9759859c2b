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

//! Transport building through in-process SOCKS5 and HTTP CONNECT proxies.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use fleetssh::model::{ProxyDescriptor, ProxyKind};
use fleetssh::shared::{EstablishError, TransportError};
use fleetssh::transport::build_transport;

const BANNER: &[u8] = b"SSH-2.0-FakeServer\r\n";

async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// SOCKS5 proxy for one client; returns the requested destination.
fn fake_socks5(listener: TcpListener, reply: u8, expect_auth: Option<(&'static str, &'static str)>) -> JoinHandle<(String, u16)> {
    tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();

        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.unwrap();
        let mut methods = vec![0u8; head[1] as usize];
        client.read_exact(&mut methods).await.unwrap();

        if let Some((user, pass)) = expect_auth {
            assert!(methods.contains(&0x02));
            client.write_all(&[5, 2]).await.unwrap();

            let mut ver_ulen = [0u8; 2];
            client.read_exact(&mut ver_ulen).await.unwrap();
            let mut username = vec![0u8; ver_ulen[1] as usize];
            client.read_exact(&mut username).await.unwrap();
            let mut plen = [0u8; 1];
            client.read_exact(&mut plen).await.unwrap();
            let mut password = vec![0u8; plen[0] as usize];
            client.read_exact(&mut password).await.unwrap();

            assert_eq!(username, user.as_bytes());
            assert_eq!(password, pass.as_bytes());
            client.write_all(&[1, 0]).await.unwrap();
        } else {
            client.write_all(&[5, 0]).await.unwrap();
        }

        let mut request = [0u8; 4];
        client.read_exact(&mut request).await.unwrap();
        assert_eq!(request[1], 0x01, "expected CONNECT");
        let host = match request[3] {
            0x03 => {
                let mut len = [0u8; 1];
                client.read_exact(&mut len).await.unwrap();
                let mut name = vec![0u8; len[0] as usize];
                client.read_exact(&mut name).await.unwrap();
                String::from_utf8(name).unwrap()
            }
            0x01 => {
                let mut ip = [0u8; 4];
                client.read_exact(&mut ip).await.unwrap();
                std::net::Ipv4Addr::from(ip).to_string()
            }
            other => panic!("unexpected address type {other}"),
        };
        let mut port = [0u8; 2];
        client.read_exact(&mut port).await.unwrap();

        client
            .write_all(&[5, reply, 0, 0x01, 127, 0, 0, 1, 0, 22])
            .await
            .unwrap();
        if reply == 0 {
            client.write_all(BANNER).await.unwrap();
        }
        (host, u16::from_be_bytes(port))
    })
}

/// HTTP CONNECT proxy for one client; returns the request head.
fn fake_http(listener: TcpListener, status_line: &'static str) -> JoinHandle<String> {
    tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }

        let mut response = format!("{status_line}\r\nProxy-Agent: fake\r\n\r\n").into_bytes();
        response.extend_from_slice(BANNER);
        client.write_all(&response).await.unwrap();
        String::from_utf8(head).unwrap()
    })
}

async fn read_banner(stream: &mut TcpStream) -> Vec<u8> {
    let mut banner = vec![0u8; BANNER.len()];
    stream.read_exact(&mut banner).await.unwrap();
    banner
}

#[tokio::test]
async fn test_socks5_tunnel_by_hostname() {
    let (listener, port) = listen().await;
    let proxy_task = fake_socks5(listener, 0, None);

    let proxy = ProxyDescriptor::new(ProxyKind::Socks5, "127.0.0.1", port);
    let mut stream = build_transport("db.internal", 2222, Some(&proxy), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(read_banner(&mut stream).await, BANNER);
    assert_eq!(proxy_task.await.unwrap(), ("db.internal".to_string(), 2222));
}

#[tokio::test]
async fn test_socks5_with_credentials() {
    let (listener, port) = listen().await;
    let proxy_task = fake_socks5(listener, 0, Some(("alice", "s3cret")));

    let proxy =
        ProxyDescriptor::new(ProxyKind::Socks5, "127.0.0.1", port).with_credentials("alice", "s3cret");
    let mut stream = build_transport("10.0.0.7", 22, Some(&proxy), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(read_banner(&mut stream).await, BANNER);
    assert_eq!(proxy_task.await.unwrap(), ("10.0.0.7".to_string(), 22));
}

#[tokio::test]
async fn test_socks5_refusal_is_transport_error() {
    let (listener, port) = listen().await;
    let _proxy_task = fake_socks5(listener, 0x05, None);

    let proxy = ProxyDescriptor::new(ProxyKind::Socks5, "127.0.0.1", port);
    let err = build_transport("db.internal", 22, Some(&proxy), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(err.is_transport(), "unexpected error: {err}");
    assert!(err.to_string().contains("connection refused"), "{err}");
}

#[tokio::test]
async fn test_http_connect_tunnel() {
    let (listener, port) = listen().await;
    let proxy_task = fake_http(listener, "HTTP/1.1 200 Connection established");

    let proxy =
        ProxyDescriptor::new(ProxyKind::Http, "127.0.0.1", port).with_credentials("alice", "s3cret");
    let mut stream = build_transport("web.internal", 22, Some(&proxy), Duration::from_secs(5))
        .await
        .unwrap();

    // Bytes sent right after the response head belong to the tunnel.
    assert_eq!(read_banner(&mut stream).await, BANNER);

    let head = proxy_task.await.unwrap();
    assert!(head.starts_with("CONNECT web.internal:22 HTTP/1.1\r\n"));
    assert!(head.contains("Host: web.internal:22\r\n"));
    assert!(head.contains("Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n"));
}

#[tokio::test]
async fn test_http_rejection_is_transport_error() {
    let (listener, port) = listen().await;
    let _proxy_task = fake_http(listener, "HTTP/1.1 407 Proxy Authentication Required");

    let proxy = ProxyDescriptor::new(ProxyKind::Http, "127.0.0.1", port);
    let err = build_transport("web.internal", 22, Some(&proxy), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EstablishError::Transport(TransportError::ProxyRejected { .. })
    ));
    assert!(err.to_string().contains("407"), "{err}");
}
