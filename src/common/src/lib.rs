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

//! Shared building blocks of the export engine: domain types, the column
//! schema and row model, the execution context used for cooperative
//! cancellation, and the error taxonomy every crate speaks.

pub mod context;
pub mod error;
pub mod row;
pub mod schema;
pub mod types;

pub use context::ExecContext;
pub use error::{ErrorKind, ExportError, Result, Stage};
pub use row::{Row, Value};
pub use schema::{Column, DataType, Schema};
pub use types::*;
