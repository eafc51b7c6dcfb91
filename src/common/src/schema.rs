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

use itertools::Itertools;
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// Logical column type. Drives value coercion in renderers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize,
)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Int,
    Float,
    Bool,
    Date,
    Time,
    Datetime,
}

/// Per-column output formatting hints.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnFormat {
    /// A chrono-style layout string for temporal types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ColumnFormat>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            label: None,
            data_type,
            format: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_layout(mut self, layout: impl Into<String>) -> Self {
        self.format = Some(ColumnFormat {
            layout: Some(layout.into()),
            ..self.format.unwrap_or_default()
        });
        self
    }

    /// The column header shown in rendered output.
    pub fn header(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// An ordered set of columns. Rows align with it positionally.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Restrict the schema to `names`, preserving the requested order. An
    /// empty request keeps the full schema; an unknown name is a validation
    /// error.
    pub fn project(&self, names: &[String]) -> Result<Schema> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        if let Some(dup) = names.iter().duplicates().next() {
            return Err(ExportError::validation(format!(
                "duplicate column {dup:?} requested"
            )));
        }
        let columns = names
            .iter()
            .map(|name| {
                self.column(name).cloned().ok_or_else(|| {
                    ExportError::validation(format!("unknown column {name:?}"))
                })
            })
            .try_collect()?;
        Ok(Schema { columns })
    }
}
