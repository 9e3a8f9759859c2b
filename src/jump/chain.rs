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

//! Hop-by-hop tunnel construction.
//!
//! The chain is walked with an explicit loop over the hop index. Every
//! authenticated hop is pushed onto `active`; the next hop (or the final
//! target) is reached through a `direct-tcpip` channel opened on the last
//! entry. On failure the active hops are closed in reverse order before the
//! error is returned, and on success they are handed to the final [`Client`].

use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use super::cleanup::close_hops;
use crate::model::{ConnectionEndpoint, JumpHop, RoutingMode};
use crate::shared::{ConfigurationError, EstablishError};
use crate::ssh::{Client, ServerCheckMethod, SshConnectionConfig};
use crate::transport::build_transport;

/// Default upper bound on the number of jump hosts in one chain.
pub const DEFAULT_MAX_JUMP_HOPS: usize = 10;

/// Reject chains that loop back to the target, repeat a hop or are too long.
///
/// Only ids are inspected, so this runs before any hop is resolved or
/// contacted.
pub fn validate_chain(target: &ConnectionEndpoint, max_hops: usize) -> Result<(), ConfigurationError> {
    let chain = &target.jump_chain;
    if chain.iter().any(|id| id == &target.id) {
        return Err(ConfigurationError::SelfReferencingJumpChain(target.id.clone()));
    }
    if chain.len() > max_hops {
        return Err(ConfigurationError::JumpChainTooLong {
            len: chain.len(),
            max: max_hops,
        });
    }
    let mut seen = HashSet::with_capacity(chain.len());
    for id in chain {
        if !seen.insert(id.as_str()) {
            return Err(ConfigurationError::DuplicateJumpHost { hop: id.clone() });
        }
    }
    Ok(())
}

/// A hop must not declare a jump chain of its own.
pub fn ensure_not_nested(hop: &ConnectionEndpoint) -> Result<(), ConfigurationError> {
    if hop.jump_chain.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::NestedJumpChain {
            hop: hop.id.clone(),
        })
    }
}

/// Build an authenticated session to `target` through `hops`, in order.
///
/// Each network step is bounded by `step_timeout`. Errors raised while
/// reaching a hop are wrapped with the hop index and name.
pub async fn resolve_chain(
    hops: &[JumpHop],
    target: &ConnectionEndpoint,
    server_check: &ServerCheckMethod,
    ssh_config: &SshConnectionConfig,
    step_timeout: Duration,
) -> Result<Client, EstablishError> {
    if hops.is_empty() {
        return Err(ConfigurationError::invalid("jump chain", "must contain at least one hop").into());
    }

    let mut active: Vec<Client> = Vec::with_capacity(hops.len());
    for (index, hop) in hops.iter().enumerate() {
        let connected = match active.last() {
            None => connect_first_hop(&hop.endpoint, server_check, ssh_config, step_timeout).await,
            Some(previous) => {
                connect_through(previous, &hop.endpoint, server_check, ssh_config, step_timeout).await
            }
        };

        match connected {
            Ok(client) => {
                debug!("Jump host #{index} ({}) authenticated", hop.name);
                active.push(client);
            }
            Err(e) => {
                close_hops(&active).await;
                return Err(e.at_hop(index, &hop.name));
            }
        }
    }

    let last = active.len() - 1;
    match connect_through(&active[last], target, server_check, ssh_config, step_timeout).await {
        Ok(client) => {
            info!(
                "Connected to {} through {} jump host(s)",
                target.address(),
                active.len()
            );
            Ok(client.with_hops(active))
        }
        Err(e) => {
            close_hops(&active).await;
            Err(e)
        }
    }
}

/// The first hop is reached over TCP, through its own proxy when it has one.
async fn connect_first_hop(
    hop: &ConnectionEndpoint,
    server_check: &ServerCheckMethod,
    ssh_config: &SshConnectionConfig,
    step_timeout: Duration,
) -> Result<Client, EstablishError> {
    let proxy = match hop.routing_mode {
        RoutingMode::Proxy => hop.proxy.as_ref(),
        _ => None,
    };
    let stream = build_transport(&hop.host, hop.port, proxy, step_timeout).await?;
    Client::connect_stream(stream, hop, server_check.clone(), ssh_config, step_timeout).await
}

/// Open a `direct-tcpip` channel on `previous` and run SSH over it.
async fn connect_through(
    previous: &Client,
    next: &ConnectionEndpoint,
    server_check: &ServerCheckMethod,
    ssh_config: &SshConnectionConfig,
    step_timeout: Duration,
) -> Result<Client, EstablishError> {
    let stage = format!(
        "opening tunnel from {}:{} to {}:{}",
        previous.host(),
        previous.port(),
        next.host,
        next.port
    );
    debug!("{stage}");

    let channel = tokio::time::timeout(
        step_timeout,
        previous.open_direct_tcpip_channel(&next.host, next.port),
    )
    .await
    .map_err(|_| EstablishError::timeout(&stage, step_timeout))?
    .map_err(|e| EstablishError::ssh(&stage, e))?;

    Client::connect_stream(
        channel.into_stream(),
        next,
        server_check.clone(),
        ssh_config,
        step_timeout,
    )
    .await
}
