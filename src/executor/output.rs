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

//! Bounded output capture.
//!
//! Output is kept twice: in memory for the final subtask record, and in the
//! task store through a throttled writer. Both stop accepting text at the
//! same byte limit and cut on a UTF-8 character boundary.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::store::TaskStore;

/// Longest prefix of `text` that fits in `max_bytes` without splitting a character.
pub(crate) fn truncate_to_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Decodes a byte stream as UTF-8 across packet boundaries.
///
/// An incomplete character at the end of a packet is held back until the
/// next packet completes it. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes`, returning only complete characters.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid..];
                        }
                        // Truncated character; wait for the next packet.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;
        text
    }

    /// Flush whatever is still held back once the stream has ended.
    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// In-memory output capped at a fixed number of bytes; excess is dropped.
#[derive(Debug)]
pub struct OutputBuffer {
    text: String,
    max_bytes: usize,
    dropped_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes,
            dropped_bytes: 0,
        }
    }

    /// Append as much of `chunk` as fits.
    pub fn push(&mut self, chunk: &str) {
        let room = self.max_bytes - self.text.len();
        let accepted = truncate_to_boundary(chunk, room);
        self.text.push_str(accepted);

        let dropped = chunk.len() - accepted.len();
        if dropped > 0 {
            if self.dropped_bytes == 0 {
                debug!("Output limit of {} bytes reached, dropping the rest", self.max_bytes);
            }
            self.dropped_bytes += dropped;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped_bytes > 0
    }

    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// Writes output to the task store at most once per interval.
///
/// Pending text is kept across failed writes and retried on the next flush.
/// Write failures are logged and never reach the caller.
pub struct ThrottledOutputWriter {
    store: Arc<dyn TaskStore>,
    subtask_id: String,
    pending: String,
    /// Bytes accepted so far, written or pending.
    accepted: usize,
    max_bytes: usize,
    interval: Duration,
    last_flush: Option<Instant>,
}

impl ThrottledOutputWriter {
    pub fn new(
        store: Arc<dyn TaskStore>,
        subtask_id: impl Into<String>,
        max_bytes: usize,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            subtask_id: subtask_id.into(),
            pending: String::new(),
            accepted: 0,
            max_bytes,
            interval,
            last_flush: None,
        }
    }

    /// Queue `chunk` and flush if the interval has passed since the last write.
    pub async fn push(&mut self, chunk: &str) {
        let room = self.max_bytes - self.accepted;
        let accepted = truncate_to_boundary(chunk, room);
        if !accepted.is_empty() {
            self.pending.push_str(accepted);
            self.accepted += accepted.len();
        }

        let due = self
            .last_flush
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            self.flush().await;
        }
    }

    /// Write whatever is pending.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.last_flush = Some(Instant::now());
        match self
            .store
            .append_subtask_output(&self.subtask_id, &self.pending)
            .await
        {
            Ok(()) => self.pending.clear(),
            Err(e) => warn!(
                "Failed to persist output for subtask {}: {e:#}",
                self.subtask_id
            ),
        }
    }

    /// Bytes accepted for persistence so far.
    pub fn accepted_bytes(&self) -> usize {
        self.accepted
    }
}
