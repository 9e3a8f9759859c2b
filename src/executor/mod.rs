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

//! Batch task execution: orchestration, command running, output capture and
//! persistence.

mod orchestrator;
mod output;
mod runner;

pub mod command;
pub mod registry;
pub mod sink;
pub mod status;
pub mod store;

pub use command::{build_command_line, shell_escape};
pub use orchestrator::{BatchOrchestrator, TaskHandle};
pub use output::{OutputBuffer, ThrottledOutputWriter};
pub use registry::CancellationRegistry;
pub use runner::{CommandRunner, RunOutcome};
pub use sink::{BroadcastEventSink, EventSink, NullEventSink};
pub use status::finalize_status;
pub use store::{InMemoryTaskStore, TaskStore};
