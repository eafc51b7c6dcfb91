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
use outflow_common::types::{Format, RenderOptions, TemplateStrategy};
use outflow_common::{ExecContext, ExportError, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{check_row_width, format_text, resolve_timezone, CountingWriter, RenderSummary, Renderer};
use crate::source::RowIterator;

/// Template-style table renderer with two strategies: `buffered` collects the
/// body up front and enforces a row cap, `streaming` hands each row to the
/// template as it is produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn document_head(schema: &Schema, options: &RenderOptions) -> String {
    let title = options
        .html
        .title
        .as_deref()
        .unwrap_or("Export");
    let mut head = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n<table>\n<thead><tr>",
        escape_html(title)
    );
    for column in &schema.columns {
        head.push_str("<th>");
        head.push_str(&escape_html(column.header()));
        head.push_str("</th>");
    }
    head.push_str("</tr></thead>\n<tbody>\n");
    head
}

const DOCUMENT_FOOT: &str = "</tbody>\n</table>\n</body>\n</html>\n";

#[async_trait]
impl Renderer for HtmlRenderer {
    fn format(&self) -> Format {
        Format::Html
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
        let mut writer = CountingWriter::new(sink);
        let mut rows_written = 0u64;

        match options.html.strategy {
            TemplateStrategy::Streaming => {
                writer.write_all(document_head(schema, options).as_bytes()).await?;
                while let Some(row) = rows.next().await? {
                    ctx.check()?;
                    check_row_width(&row, schema)?;
                    let mut fragment = String::from("<tr>");
                    for (value, column) in row.iter().zip(schema.columns.iter()) {
                        fragment.push_str("<td>");
                        fragment.push_str(&escape_html(&format_text(value, column, &tz)?));
                        fragment.push_str("</td>");
                    }
                    fragment.push_str("</tr>\n");
                    writer.write_all(fragment.as_bytes()).await?;
                    rows_written += 1;
                }
            }
            TemplateStrategy::Buffered => {
                // The cap is checked while collecting, before anything is
                // written, so an oversized result never emits a partial page.
                let cap = options.html.max_buffered_rows;
                let mut body = Vec::new();
                while let Some(row) = rows.next().await? {
                    ctx.check()?;
                    check_row_width(&row, schema)?;
                    if body.len() >= cap {
                        return Err(ExportError::validation(format!(
                            "buffered template exceeded the row cap of {cap}"
                        )));
                    }
                    body.push(row);
                }
                writer.write_all(document_head(schema, options).as_bytes()).await?;
                for row in &body {
                    let mut fragment = String::from("<tr>");
                    for (value, column) in row.iter().zip(schema.columns.iter()) {
                        fragment.push_str("<td>");
                        fragment.push_str(&escape_html(&format_text(value, column, &tz)?));
                        fragment.push_str("</td>");
                    }
                    fragment.push_str("</tr>\n");
                    writer.write_all(fragment.as_bytes()).await?;
                    rows_written += 1;
                }
            }
        }

        writer.write_all(DOCUMENT_FOOT.as_bytes()).await?;
        writer.flush().await?;
        Ok(RenderSummary {
            rows_written,
            bytes_written: writer.bytes_written(),
        })
    }
}

#[cfg(test)]
mod tests {
    use outflow_common::row;
    use outflow_common::schema::{Column, DataType};

    use super::*;
    use crate::source::{MemorySource, RowSource, RowSourceSpec};

    async fn render_to_string(
        rows: Vec<outflow_common::Row>,
        options: RenderOptions,
    ) -> Result<(String, RenderSummary)> {
        let schema = Schema::new(vec![
            Column::new("id", DataType::Int),
            Column::new("name", DataType::String).with_label("Name"),
        ]);
        let ctx = ExecContext::new();
        let spec = RowSourceSpec {
            request: outflow_common::ExportRequest::new("users", Format::Html),
            columns: schema.columns.clone(),
            actor: outflow_common::Actor::new("tester"),
        };
        let mut iter = MemorySource::new(rows).open(&ctx, spec).await?;
        let mut sink = Vec::new();
        let res = HtmlRenderer
            .render(&ctx, &schema, iter.as_mut(), &mut sink, &options)
            .await;
        iter.close().await?;
        let summary = res?;
        Ok((String::from_utf8(sink).unwrap(), summary))
    }

    #[tokio::test]
    async fn test_buffered_table() {
        let (text, summary) = render_to_string(
            vec![row![1i64, "alice"], row![2i64, "<bob>"]],
            RenderOptions::default(),
        )
        .await
        .unwrap();
        assert!(text.starts_with("<!DOCTYPE html>"));
        assert!(text.contains("<th>id</th><th>Name</th>"));
        assert!(text.contains("<td>1</td><td>alice</td>"));
        assert!(text.contains("<td>2</td><td>&lt;bob&gt;</td>"));
        assert!(text.ends_with("</html>\n"));
        assert_eq!(summary.rows_written, 2);
    }

    #[tokio::test]
    async fn test_buffered_row_cap() {
        let mut options = RenderOptions::default();
        options.html.max_buffered_rows = 1;
        let err = render_to_string(vec![row![1i64, "a"], row![2i64, "b"]], options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), outflow_common::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_streaming_matches_buffered_body() {
        let rows = vec![row![1i64, "a"], row![2i64, "b"]];
        let (buffered, _) = render_to_string(rows.clone(), RenderOptions::default())
            .await
            .unwrap();
        let mut options = RenderOptions::default();
        options.html.strategy = TemplateStrategy::Streaming;
        let (streamed, summary) = render_to_string(rows, options).await.unwrap();
        assert_eq!(buffered, streamed);
        assert_eq!(summary.rows_written, 2);
    }

    #[tokio::test]
    async fn test_custom_title_escaped() {
        let mut options = RenderOptions::default();
        options.html.title = Some("Q1 <report>".into());
        let (text, _) = render_to_string(vec![], options).await.unwrap();
        assert!(text.contains("<title>Q1 &lt;report&gt;</title>"));
    }
}
