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
use outflow_common::schema::Schema;
use outflow_common::types::{Format, RenderOptions};
use outflow_common::{ExecContext, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{check_row_width, resolve_timezone, value_to_json, CountingWriter, RenderSummary, Renderer};
use crate::source::RowIterator;

/// A JSON array of objects keyed by column name, streamed row by row.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

#[async_trait]
impl Renderer for JsonRenderer {
    fn format(&self) -> Format {
        Format::Json
    }

    async fn render(
        &self,
        ctx: &ExecContext,
        schema: &Schema,
        rows: &mut dyn RowIterator,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        options: &RenderOptions,
    ) -> Result<RenderSummary> {
        let tz = resolve_timezone(options)?;
        let pretty = options.json.pretty;
        let mut writer = CountingWriter::new(sink);

        writer.write_all(b"[").await?;
        let mut rows_written = 0u64;
        while let Some(row) = rows.next().await? {
            ctx.check()?;
            check_row_width(&row, schema)?;

            let mut object = serde_json::Map::with_capacity(schema.column_count());
            for (value, column) in row.iter().zip(schema.columns.iter()) {
                object.insert(column.name.clone(), value_to_json(value, column, &tz)?);
            }

            if rows_written > 0 {
                writer.write_all(b",").await?;
            }
            if pretty {
                writer.write_all(b"\n").await?;
                let text = serde_json::to_string_pretty(&object)?;
                writer.write_all(text.as_bytes()).await?;
            } else {
                let text = serde_json::to_string(&object)?;
                writer.write_all(text.as_bytes()).await?;
            }
            rows_written += 1;
        }
        if pretty && rows_written > 0 {
            writer.write_all(b"\n").await?;
        }
        writer.write_all(b"]").await?;

        writer.flush().await?;
        Ok(RenderSummary {
            rows_written,
            bytes_written: writer.bytes_written(),
        })
    }
}
