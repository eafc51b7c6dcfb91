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

//! Pluggable edges of the export pipeline: row sources producing lazy row
//! iterators on one side, renderers turning schema + rows into a byte stream
//! on the other. Concrete integrations (SQL sources, spreadsheet renderers,
//! …) live out of tree and implement the same contracts.

pub mod render;
pub mod source;
