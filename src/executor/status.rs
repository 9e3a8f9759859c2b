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

//! Final task status from settled subtask counts.

use crate::model::{TaskProgress, TaskStatus};

/// Decide the final status of a task.
///
/// Priority: explicit cancellation, all cancelled, all failed, all completed,
/// any completed or failed (partial), otherwise cancelled. Pure and
/// idempotent.
pub fn finalize_status(counts: &TaskProgress, total: usize, cancel_requested: bool) -> TaskStatus {
    if cancel_requested {
        return TaskStatus::Cancelled;
    }
    if total == 0 {
        return TaskStatus::Cancelled;
    }
    if counts.cancelled == total {
        TaskStatus::Cancelled
    } else if counts.failed == total {
        TaskStatus::Failed
    } else if counts.completed == total {
        TaskStatus::Completed
    } else if counts.completed + counts.failed > 0 {
        TaskStatus::PartiallyCompleted
    } else {
        TaskStatus::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(completed: usize, failed: usize, cancelled: usize) -> TaskProgress {
        TaskProgress {
            overall_progress: 100,
            completed,
            failed,
            cancelled,
        }
    }

    #[test]
    fn test_priority_rules() {
        assert_eq!(finalize_status(&counts(3, 0, 0), 3, false), TaskStatus::Completed);
        assert_eq!(finalize_status(&counts(0, 3, 0), 3, false), TaskStatus::Failed);
        assert_eq!(finalize_status(&counts(0, 0, 3), 3, false), TaskStatus::Cancelled);
        assert_eq!(
            finalize_status(&counts(2, 1, 0), 3, false),
            TaskStatus::PartiallyCompleted
        );
        assert_eq!(
            finalize_status(&counts(1, 0, 2), 3, false),
            TaskStatus::PartiallyCompleted
        );
        assert_eq!(finalize_status(&counts(0, 0, 0), 0, false), TaskStatus::Cancelled);
    }

    #[test]
    fn test_explicit_cancel_wins() {
        assert_eq!(finalize_status(&counts(3, 0, 0), 3, true), TaskStatus::Cancelled);
    }

    #[test]
    fn test_idempotent() {
        let settled = counts(2, 1, 0);
        let first = finalize_status(&settled, 3, false);
        assert_eq!(first, finalize_status(&settled, 3, false));
    }
}
