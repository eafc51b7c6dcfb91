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

use super::{check_row_width, format_text, resolve_timezone, CountingWriter, RenderSummary, Renderer};
use crate::source::RowIterator;

/// RFC 4180 style CSV. One header row (unless disabled), `\n` line endings,
/// quoting only where the field requires it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRenderer;

fn escape_field(field: &str, delimiter: char) -> String {
    let needs_quoting = field.contains(delimiter)
        || field.contains('"')
        || field.contains('\n')
        || field.contains('\r');
    if needs_quoting {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

#[async_trait]
impl Renderer for CsvRenderer {
    fn format(&self) -> Format {
        Format::Csv
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
        let delimiter = options.csv.delimiter;
        let mut writer = CountingWriter::new(sink);

        let mut line = String::new();
        if options.csv.header {
            for (i, column) in schema.columns.iter().enumerate() {
                if i > 0 {
                    line.push(delimiter);
                }
                line.push_str(&escape_field(column.header(), delimiter));
            }
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
        }

        let mut rows_written = 0u64;
        while let Some(row) = rows.next().await? {
            ctx.check()?;
            check_row_width(&row, schema)?;
            line.clear();
            for (i, (value, column)) in row.iter().zip(schema.columns.iter()).enumerate() {
                if i > 0 {
                    line.push(delimiter);
                }
                line.push_str(&escape_field(&format_text(value, column, &tz)?, delimiter));
            }
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            rows_written += 1;
        }

        writer.flush().await?;
        Ok(RenderSummary {
            rows_written,
            bytes_written: writer.bytes_written(),
        })
    }
}
