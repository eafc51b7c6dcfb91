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

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use outflow_common::error::{Stage, StageExt};
use outflow_common::types::{Actor, ExportRequest, RenderOptions, ResolvedDefinition};
use outflow_common::{ExecContext, Result, Row};
use outflow_connector::render::RenderSummary;
use outflow_connector::source::{BoxRowIterator, RowIterator, RowSourceSpec};
use tokio::io::AsyncWrite;

use crate::guard::ExportGuard;
use crate::registry::{DefinitionRegistry, RendererRegistry, SourceRegistry};

/// Receives counter deltas while an execution streams. The service points
/// this at the tracker; tests record the calls.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn advance(&self, rows: u64, bytes: u64) -> Result<()>;
}

/// What one execution attempt produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Definition with the schema already projected to the requested columns.
    pub resolved: ResolvedDefinition,
    pub summary: RenderSummary,
}

/// Orchestrates a single execution attempt:
/// resolve → authorize → open → render, with the iterator closed on every
/// exit path. Failures carry the stage they surfaced in.
pub struct ExportRunner {
    definitions: Arc<DefinitionRegistry>,
    sources: Arc<SourceRegistry>,
    renderers: Arc<RendererRegistry>,
    guard: Option<Arc<dyn ExportGuard>>,
    /// Progress is flushed to the sink every this many rows.
    advance_every: u64,
}

impl ExportRunner {
    pub fn new(
        definitions: Arc<DefinitionRegistry>,
        sources: Arc<SourceRegistry>,
        renderers: Arc<RendererRegistry>,
    ) -> Self {
        Self {
            definitions,
            sources,
            renderers,
            guard: None,
            advance_every: 500,
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn ExportGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_advance_every(mut self, rows: u64) -> Self {
        self.advance_every = rows.max(1);
        self
    }

    /// Resolve the definition and project its schema onto the requested
    /// columns.
    pub fn resolve(&self, request: &ExportRequest) -> Result<ResolvedDefinition> {
        let definition = self.definitions.resolve(&request.definition)?;
        let schema = definition.schema.project(&request.columns)?;
        Ok(ResolvedDefinition {
            schema,
            ..definition
        })
    }

    /// Renderer options for this request: the request's options unless it
    /// left them untouched, in which case the definition's defaults apply;
    /// timezone and locale fall back to the request-level fields.
    pub fn resolve_options(
        request: &ExportRequest,
        resolved: &ResolvedDefinition,
    ) -> RenderOptions {
        let mut options = if request.render_options == RenderOptions::default() {
            resolved.default_render_options.clone()
        } else {
            request.render_options.clone()
        };
        if options.timezone.is_none() {
            options.timezone = Some(request.timezone.clone());
        }
        if options.locale.is_none() {
            options.locale = Some(request.locale.clone());
        }
        options
    }

    pub async fn run(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        request: &ExportRequest,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: Option<&dyn ProgressSink>,
    ) -> Result<RunOutcome> {
        ctx.check()?;
        let resolved = self.resolve(request).at_stage(Stage::Open)?;
        let options = Self::resolve_options(request, &resolved);

        // The guard runs strictly before the source is opened; a denied
        // actor must never reach a backend.
        if let Some(guard) = &self.guard {
            guard.authorize_export(actor, request, &resolved).await?;
        }

        let source = self
            .sources
            .resolve(&resolved.row_source_key)
            .at_stage(Stage::Open)?;
        let spec = RowSourceSpec {
            request: request.clone(),
            columns: resolved.schema.columns.clone(),
            actor: actor.clone(),
        };
        let iter = source.open(ctx, spec).await.at_stage(Stage::Open)?;

        let renderer = match self.renderers.resolve(request.format) {
            Ok(renderer) => renderer,
            Err(e) => {
                let mut iter = iter;
                let _ = iter.close().await;
                return Err(e.at(Stage::Render));
            }
        };

        let bytes = Arc::new(AtomicU64::new(0));
        let mut counting_sink = ByteCountSink {
            inner: sink,
            bytes: bytes.clone(),
        };
        let mut rows = ProgressIterator {
            inner: iter,
            progress,
            bytes,
            reported_bytes: 0,
            pending_rows: 0,
            every: self.advance_every,
        };

        let render_res = renderer
            .render(ctx, &resolved.schema, &mut rows, &mut counting_sink, &options)
            .await;
        let flush_res = rows.flush_progress().await;
        let close_res = rows.close().await;

        let summary = render_res.at_stage(Stage::Render)?;
        flush_res.at_stage(Stage::Track)?;
        close_res.at_stage(Stage::Open)?;

        tracing::debug!(
            definition = %resolved.name,
            rows = summary.rows_written,
            bytes = summary.bytes_written,
            "export attempt rendered"
        );
        Ok(RunOutcome { resolved, summary })
    }
}

/// Counts bytes into a shared counter so the progress iterator can report
/// byte deltas alongside row deltas.
struct ByteCountSink<'a> {
    inner: &'a mut (dyn AsyncWrite + Send + Unpin),
    bytes: Arc<AtomicU64>,
}

impl AsyncWrite for ByteCountSink<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut *this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.bytes.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Forwards rows while flushing counter deltas to the progress sink every
/// `every` rows.
struct ProgressIterator<'a> {
    inner: BoxRowIterator,
    progress: Option<&'a dyn ProgressSink>,
    bytes: Arc<AtomicU64>,
    reported_bytes: u64,
    pending_rows: u64,
    every: u64,
}

impl ProgressIterator<'_> {
    async fn flush_progress(&mut self) -> Result<()> {
        let Some(progress) = self.progress else {
            return Ok(());
        };
        let total_bytes = self.bytes.load(Ordering::Relaxed);
        let byte_delta = total_bytes - self.reported_bytes;
        if self.pending_rows == 0 && byte_delta == 0 {
            return Ok(());
        }
        progress.advance(self.pending_rows, byte_delta).await?;
        self.pending_rows = 0;
        self.reported_bytes = total_bytes;
        Ok(())
    }
}

#[async_trait]
impl RowIterator for ProgressIterator<'_> {
    async fn next(&mut self) -> Result<Option<Row>> {
        let row = self.inner.next().await?;
        if row.is_some() {
            self.pending_rows += 1;
            if self.pending_rows >= self.every {
                self.flush_progress().await.at_stage(Stage::Track)?;
            }
        }
        Ok(row)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
