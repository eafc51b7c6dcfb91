// Copyright 2023 RisingWave Labs
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

//! Asynchronous execution of exports: building deduplicated job messages,
//! handing them to an external queue through the [`Enqueuer`] seam, and
//! driving the worker-side retry loop with cancellation support.

pub mod idempotency;
pub mod message;
pub mod queue;
pub mod retry;
pub mod task;

pub use idempotency::{request_signature, IdempotencyStore, MemoryIdempotencyStore};
pub use message::{
    BuildOutcome, DedupPolicy, ExecutionMessage, JobPayload, MessageBuilder, MessageParameters,
};
pub use queue::{Enqueuer, ExportScheduler, ScheduleOutcome};
pub use retry::{Backoff, BackoffStrategy, RetryPolicy};
pub use task::{ExecutionHandler, GenerateExportCommand, GenerateTask, ServiceHandler};
