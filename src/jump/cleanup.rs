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

use tracing::debug;

use crate::ssh::Client;

/// Disconnect hop sessions in reverse creation order.
///
/// Each hop carries the transport of the one after it, so the innermost hop
/// goes first. Errors are logged and ignored.
pub async fn close_hops(hops: &[Client]) {
    for (index, hop) in hops.iter().enumerate().rev() {
        match hop.disconnect().await {
            Ok(()) => debug!("Closed jump host #{index} ({}:{})", hop.host(), hop.port()),
            Err(e) => debug!(
                "Failed to close jump host #{index} ({}:{}): {e}",
                hop.host(),
                hop.port()
            ),
        }
    }
}
