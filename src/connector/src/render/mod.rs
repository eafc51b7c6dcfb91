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

use async_trait::async_trait;
use chrono_tz::Tz;
use outflow_common::schema::{Column, DataType, Schema};
use outflow_common::types::{Format, RenderOptions};
use outflow_common::{ExecContext, ExportError, Result, Row, Value};
use tokio::io::AsyncWrite;

mod csv;
mod html;
mod json;
mod writer;

pub use csv::CsvRenderer;
pub use html::HtmlRenderer;
pub use json::JsonRenderer;
pub use writer::CountingWriter;

use crate::source::RowIterator;

/// What a renderer produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderSummary {
    pub rows_written: u64,
    pub bytes_written: u64,
}

/// Streams schema-aligned rows into a byte sink in one concrete format.
///
/// Contract:
/// - rows are consumed lazily; only the buffered template strategy may hold
///   more than a handful of rows in memory, bounded by its row cap.
/// - emitted bytes are counted through [`CountingWriter`].
/// - a row whose length disagrees with the schema is a validation error.
/// - once the context is done, rendering stops promptly with the context
///   error.
#[async_trait]
pub trait Renderer: Send + Sync {
    fn format(&self) -> Format;

    async fn render(
        &self,
        ctx: &ExecContext,
        schema: &Schema,
        rows: &mut dyn RowIterator,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        options: &RenderOptions,
    ) -> Result<RenderSummary>;
}

pub(crate) fn check_row_width(row: &Row, schema: &Schema) -> Result<()> {
    if row.len() != schema.column_count() {
        return Err(ExportError::validation(format!(
            "row has {} values, schema has {} columns",
            row.len(),
            schema.column_count()
        )));
    }
    Ok(())
}

pub(crate) fn resolve_timezone(options: &RenderOptions) -> Result<Tz> {
    let name = options.timezone.as_deref().unwrap_or("UTC");
    name.parse::<Tz>()
        .map_err(|_| ExportError::validation(format!("unknown timezone {name:?}")))
}

const DEFAULT_DATE_LAYOUT: &str = "%Y-%m-%d";
const DEFAULT_TIME_LAYOUT: &str = "%H:%M:%S";
const DEFAULT_DATETIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Caller-supplied layouts must be validated up front: formatting with a
/// malformed strftime string panics inside `Display`.
fn layout_for(column: &Column, default: &'static str) -> Result<String> {
    let Some(layout) = column.format.as_ref().and_then(|f| f.layout.clone()) else {
        return Ok(default.to_owned());
    };
    let malformed = chrono::format::StrftimeItems::new(&layout)
        .any(|item| matches!(item, chrono::format::Item::Error));
    if malformed {
        return Err(ExportError::validation(format!(
            "invalid layout {layout:?} on column {:?}",
            column.name
        )));
    }
    Ok(layout)
}

/// Coerce one cell to text for line-oriented formats. Temporal values honor
/// the column layout and the output timezone.
pub(crate) fn format_text(value: &Value, column: &Column, tz: &Tz) -> Result<String> {
    let text = match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
        Value::Date(d) => d
            .format(&layout_for(column, DEFAULT_DATE_LAYOUT)?)
            .to_string(),
        Value::Time(t) => t
            .format(&layout_for(column, DEFAULT_TIME_LAYOUT)?)
            .to_string(),
        Value::Timestamp(ts) => ts
            .with_timezone(tz)
            .format(&layout_for(column, DEFAULT_DATETIME_LAYOUT)?)
            .to_string(),
        Value::Json(v) => serde_json::to_string(v)?,
    };
    Ok(text)
}

/// Coerce one cell to a JSON value. Temporal values become formatted strings;
/// everything else keeps its natural JSON type.
pub(crate) fn value_to_json(value: &Value, column: &Column, tz: &Tz) -> Result<serde_json::Value> {
    let json = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Json(v) => v.clone(),
        temporal @ (Value::Date(_) | Value::Time(_) | Value::Timestamp(_)) => {
            serde_json::Value::String(format_text(temporal, column, tz)?)
        }
    };
    // An explicitly numeric column keeps numeric output even when the source
    // hands over digits as text.
    if let (DataType::Int | DataType::Float, serde_json::Value::String(s)) =
        (column.data_type, &json)
    {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(serde_json::Value::from(n));
        }
        if let Some(n) = s.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Ok(serde_json::Value::Number(n));
        }
    }
    Ok(json)
}
