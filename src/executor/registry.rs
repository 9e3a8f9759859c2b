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

//! Live task runs and their cancellation tokens.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct RunEntry {
    cancel: CancellationToken,
    /// Fired when the run has finalized.
    finished: CancellationToken,
}

/// Maps task ids to the tokens of their live runs.
///
/// One registry belongs to one orchestrator; entries exist only while a run
/// is in progress.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, RunEntry>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a run; `None` if the task already has one.
    pub fn register(&self, task_id: &str) -> Option<CancellationToken> {
        let mut runs = self.runs();
        if runs.contains_key(task_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        runs.insert(
            task_id.to_string(),
            RunEntry {
                cancel: cancel.clone(),
                finished: CancellationToken::new(),
            },
        );
        Some(cancel)
    }

    /// Raise the cancellation token of a live run.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.runs().get(task_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Token that fires once the run of `task_id` has finished.
    pub fn finished_signal(&self, task_id: &str) -> Option<CancellationToken> {
        self.runs().get(task_id).map(|entry| entry.finished.clone())
    }

    /// Remove the entry and wake anyone waiting on [`finished_signal`](Self::finished_signal).
    pub fn finish(&self, task_id: &str) {
        if let Some(entry) = self.runs().remove(task_id) {
            entry.finished.cancel();
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.runs().contains_key(task_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
