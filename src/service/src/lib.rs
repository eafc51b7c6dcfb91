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

//! The export façade. The service owns the runner, the tracker, the artifact
//! store and the cancel registry; transports and job executors talk to it
//! through a handful of operations and never to the collaborators directly.

pub mod cancel;
pub mod guard;
pub mod registry;
pub mod runner;
pub mod service;

pub use cancel::{CancelRegistration, CancelRegistry};
pub use guard::{AllowAllGuard, ExportGuard, RoleGuard};
pub use registry::{DefinitionRegistry, Registry, RendererRegistry, SourceRegistry};
pub use runner::{ExportRunner, ProgressSink, RunOutcome};
pub use service::{ExportResult, ExportService, ServiceConfig, ServiceRef};
