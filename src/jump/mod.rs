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

//! Multi-hop jump host tunnels.
//!
//! # Features
//! * Single and multi-hop chains with per-hop credentials
//! * First hop may itself sit behind a SOCKS5 or HTTP proxy
//! * Hop-indexed errors and reverse-order cleanup on failure
//! * Self-referencing, repeating, nested and over-long chains rejected up front

pub mod chain;
pub mod cleanup;

pub use chain::{ensure_not_nested, resolve_chain, validate_chain, DEFAULT_MAX_JUMP_HOPS};
pub use cleanup::close_hops;
