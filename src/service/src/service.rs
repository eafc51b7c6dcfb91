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

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use outflow_common::error::{ErrorKind, Stage, StageExt};
use outflow_common::types::{
    Actor, ArtifactMeta, Delivery, DownloadInfo, ExportId, ExportRecord, ExportRequest,
    ExportState, Format,
};
use outflow_common::{ExecContext, ExportError, Result};
use outflow_object_store::{BoxArtifactReader, SignedArtifactStore};
use outflow_tracker::{AdvanceDelta, CompleteStats, ExportTracker, RecordFilter, TrackerRef};
use tokio::io::AsyncWrite;

use crate::cancel::CancelRegistry;
use crate::guard::ExportGuard;
use crate::registry::{DefinitionRegistry, RendererRegistry, SourceRegistry};
use crate::runner::{ExportRunner, ProgressSink};

pub type ServiceRef = Arc<ExportService>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// `auto` delivery runs inline when the estimated row count stays at or
    /// below this.
    pub auto_sync_max_rows: u64,
    /// Same, for estimated bytes.
    pub auto_sync_max_bytes: u64,
    /// Stored artifacts (and their records) expire this long after
    /// completion. `None` keeps them until deleted explicitly.
    pub artifact_ttl: Option<Duration>,
    /// Key prefix for stored artifacts.
    pub artifact_prefix: String,
    /// Tracker progress flush interval, in rows.
    pub advance_every: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auto_sync_max_rows: 10_000,
            auto_sync_max_bytes: 8 << 20,
            artifact_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            artifact_prefix: "exports".to_owned(),
            advance_every: 500,
        }
    }
}

/// Outcome of one generated export.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub record: ExportRecord,
    pub rows_written: u64,
    pub bytes_written: u64,
}

/// The public façade. Owns the runner, tracker, artifact store and cancel
/// registry; everything else reaches exports through it.
pub struct ExportService {
    definitions: Arc<DefinitionRegistry>,
    sources: Arc<SourceRegistry>,
    renderers: Arc<RendererRegistry>,
    runner: ExportRunner,
    tracker: TrackerRef,
    store: Arc<SignedArtifactStore>,
    guard: Option<Arc<dyn ExportGuard>>,
    cancels: Arc<CancelRegistry>,
    config: ServiceConfig,
}

struct TrackerProgress {
    tracker: TrackerRef,
    id: ExportId,
}

#[async_trait]
impl ProgressSink for TrackerProgress {
    async fn advance(&self, rows: u64, bytes: u64) -> Result<()> {
        self.tracker
            .advance(
                &self.id,
                AdvanceDelta {
                    rows,
                    bytes,
                    errors: 0,
                },
            )
            .await
    }
}

impl ExportService {
    pub fn new(tracker: TrackerRef, store: Arc<SignedArtifactStore>) -> Self {
        Self::with_config(tracker, store, ServiceConfig::default())
    }

    pub fn with_config(
        tracker: TrackerRef,
        store: Arc<SignedArtifactStore>,
        config: ServiceConfig,
    ) -> Self {
        let definitions = Arc::new(DefinitionRegistry::new("definition"));
        let sources = Arc::new(SourceRegistry::new("row source"));
        let renderers = Arc::new(RendererRegistry::with_defaults());
        let runner = ExportRunner::new(definitions.clone(), sources.clone(), renderers.clone())
            .with_advance_every(config.advance_every);
        Self {
            definitions,
            sources,
            renderers,
            runner,
            tracker,
            store,
            guard: None,
            cancels: Arc::new(CancelRegistry::new()),
            config,
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn ExportGuard>) -> Self {
        self.runner = ExportRunner::new(
            self.definitions.clone(),
            self.sources.clone(),
            self.renderers.clone(),
        )
        .with_advance_every(self.config.advance_every)
        .with_guard(guard.clone());
        self.guard = Some(guard);
        self
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn renderers(&self) -> &RendererRegistry {
        &self.renderers
    }

    pub fn cancels(&self) -> &Arc<CancelRegistry> {
        &self.cancels
    }

    pub fn tracker(&self) -> &TrackerRef {
        &self.tracker
    }

    pub fn artifact_key(&self, id: &ExportId, format: Format) -> String {
        format!(
            "{}/{}.{}",
            self.config.artifact_prefix,
            id,
            format.extension()
        )
    }

    fn progress_for(&self, id: &ExportId) -> TrackerProgress {
        TrackerProgress {
            tracker: self.tracker.clone(),
            id: id.clone(),
        }
    }

    /// Create an export. Synchronous delivery streams the rendered bytes into
    /// `sync_out` and returns the terminal record; asynchronous delivery
    /// seeds a `queued` record and returns immediately, leaving execution to
    /// the scheduler. `auto` picks inline execution only when the request's
    /// own estimates stay under the configured thresholds and a sink is
    /// available.
    pub async fn request_export(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        request: ExportRequest,
        sync_out: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
    ) -> Result<ExportRecord> {
        request.validate()?;
        match self.route_delivery(&request, sync_out.is_some()) {
            Delivery::Sync => {
                let out = sync_out.ok_or_else(|| {
                    ExportError::validation("synchronous delivery requires an output sink")
                })?;
                self.run_sync(ctx, actor, &request, out).await
            }
            _ => {
                let record = ExportRecord::new(ExportId::new(), &request, actor);
                let id = self.tracker.start(record).await.at_stage(Stage::Track)?;
                tracing::info!(export_id = %id, definition = %request.definition, "export queued");
                self.tracker.status(&id).await
            }
        }
    }

    fn route_delivery(&self, request: &ExportRequest, has_sink: bool) -> Delivery {
        match request.delivery {
            Delivery::Sync => Delivery::Sync,
            Delivery::Async => Delivery::Async,
            Delivery::Auto => {
                let under_rows = request
                    .estimated_rows
                    .map(|rows| rows <= self.config.auto_sync_max_rows);
                let under_bytes = request
                    .estimated_bytes
                    .map(|bytes| bytes <= self.config.auto_sync_max_bytes);
                // Without any estimate the size is unknown; stay async.
                let small = match (under_rows, under_bytes) {
                    (None, None) => false,
                    (rows, bytes) => rows.unwrap_or(true) && bytes.unwrap_or(true),
                };
                if has_sink && small {
                    Delivery::Sync
                } else {
                    Delivery::Async
                }
            }
        }
    }

    async fn run_sync(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        request: &ExportRequest,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ExportRecord> {
        let record = ExportRecord::new(ExportId::new(), request, actor);
        let id = self.tracker.start(record).await.at_stage(Stage::Track)?;
        self.tracker
            .set_state(&id, ExportState::Running)
            .await
            .at_stage(Stage::Track)?;

        let progress = self.progress_for(&id);
        match self
            .runner
            .run(ctx, actor, request, out, Some(&progress))
            .await
        {
            Ok(outcome) => {
                let record = self
                    .tracker
                    .complete(
                        &id,
                        CompleteStats {
                            rows: Some(outcome.summary.rows_written),
                            bytes: Some(outcome.summary.bytes_written),
                        },
                    )
                    .await
                    .at_stage(Stage::Track)?;
                Ok(record)
            }
            Err(e) if e.is_canceled() => {
                self.finalize_cancel(&id, request.format).await;
                Err(e)
            }
            Err(e) => {
                self.finalize_failure(&id, &e).await;
                Err(e)
            }
        }
    }

    /// One execution attempt against a tracked record: transition to
    /// `running`, render into a buffer, store the artifact, complete. Leaves
    /// failure finalization to the caller so a retrying executor can decide
    /// when a failure is final.
    pub async fn execute_attempt(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        id: &ExportId,
        request: &ExportRequest,
    ) -> Result<ExportResult> {
        self.tracker
            .set_state(id, ExportState::Running)
            .await
            .at_stage(Stage::Track)?;

        let mut buffer = Vec::new();
        let progress = self.progress_for(id);
        let outcome = self
            .runner
            .run(ctx, actor, request, &mut buffer, Some(&progress))
            .await?;
        ctx.check()?;

        let key = self.artifact_key(id, request.format);
        let meta = ArtifactMeta {
            filename: format!("{}.{}", request.definition, request.format.extension()),
            content_type: request.format.content_type().to_owned(),
            size: 0,
            created_at: Utc::now(),
            expires_at: self
                .config
                .artifact_ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| Utc::now() + ttl),
        };
        let artifact = self
            .store
            .store()
            .put(ctx, &key, Bytes::from(buffer), meta)
            .await
            .at_stage(Stage::Store)?;
        self.tracker
            .set_artifact(id, artifact)
            .await
            .at_stage(Stage::Track)?;
        let record = self
            .tracker
            .complete(
                id,
                CompleteStats {
                    rows: Some(outcome.summary.rows_written),
                    bytes: Some(outcome.summary.bytes_written),
                },
            )
            .await
            .at_stage(Stage::Track)?;

        tracing::info!(
            export_id = %id,
            definition = %request.definition,
            rows = outcome.summary.rows_written,
            bytes = outcome.summary.bytes_written,
            "export completed"
        );
        Ok(ExportResult {
            record,
            rows_written: outcome.summary.rows_written,
            bytes_written: outcome.summary.bytes_written,
        })
    }

    /// Run one export to its terminal state: `completed` on success,
    /// `canceled` when the context was canceled, `failed` otherwise. The
    /// error, if any, is propagated after the record is finalized.
    pub async fn generate_export(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        id: &ExportId,
        request: &ExportRequest,
    ) -> Result<ExportResult> {
        match self.execute_attempt(ctx, actor, id, request).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_canceled() => {
                self.finalize_cancel(id, request.format).await;
                Err(e)
            }
            Err(e) => {
                self.finalize_failure(id, &e).await;
                Err(e)
            }
        }
    }

    /// Best-effort removal of a (possibly partial) artifact under this
    /// export's key. Runs on a fresh context: the caller's is typically
    /// already canceled or exhausted when cleanup happens.
    pub async fn discard_artifact(&self, id: &ExportId, format: Format) {
        let key = self.artifact_key(id, format);
        if let Err(e) = self.store.store().delete(&ExecContext::new(), &key).await {
            tracing::warn!(export_id = %id, error = %e, "failed to discard artifact");
        }
    }

    /// Drive the record to `canceled` after its execution observed
    /// cancellation, cleaning up any partial artifact first.
    pub async fn finalize_cancel(&self, id: &ExportId, format: Format) {
        self.discard_artifact(id, format).await;
        match self.tracker.set_state(id, ExportState::Canceled).await {
            Ok(_) => {
                tracing::info!(export_id = %id, "export canceled");
            }
            // Already terminal: a concurrent cancel_export beat us to it.
            Err(e) if e.kind() == ErrorKind::Conflict => {}
            Err(e) => {
                tracing::warn!(export_id = %id, error = %e, "failed to mark export canceled");
            }
        }
    }

    /// Record a terminal failure. Errors here are logged, not propagated:
    /// the original failure is what the caller needs to see.
    pub async fn finalize_failure(&self, id: &ExportId, error: &ExportError) {
        tracing::warn!(export_id = %id, error = %error, "export failed");
        if let Err(e) = self.tracker.fail(id, &error.to_string()).await {
            tracing::warn!(export_id = %id, error = %e, "failed to mark export failed");
        }
    }

    /// Cancel an export. Queued records transition directly; running ones
    /// additionally get their execution context canceled through the hook
    /// the executor registered. Terminal records are a conflict.
    pub async fn cancel_export(&self, actor: &Actor, id: &ExportId) -> Result<ExportRecord> {
        let record = self.tracker.status(id).await?;
        if record.state.is_terminal() {
            return Err(ExportError::conflict(format!(
                "export {id} is already {}",
                record.state
            )));
        }

        if self.cancels.cancel(id).is_ok() {
            tracing::info!(export_id = %id, actor = %actor.id, "canceled running execution");
        }
        match self.tracker.set_state(id, ExportState::Canceled).await {
            Ok(record) => Ok(record),
            // The execution finalized concurrently; report what it left.
            Err(e) if e.kind() == ErrorKind::Conflict => self.tracker.status(id).await,
            Err(e) => Err(e),
        }
    }

    /// Delete an export: best-effort artifact removal, then the terminal
    /// `deleted` state. Deleting twice is a no-op.
    pub async fn delete_export(&self, ctx: &ExecContext, actor: &Actor, id: &ExportId) -> Result<()> {
        let record = self.tracker.status(id).await?;
        if let Some(artifact) = &record.artifact {
            if let Err(e) = self.store.store().delete(ctx, &artifact.key).await {
                tracing::warn!(export_id = %id, error = %e, "failed to delete artifact");
            }
        }
        self.tracker.delete(id).await?;
        tracing::info!(export_id = %id, actor = %actor.id, "export deleted");
        Ok(())
    }

    pub async fn status(&self, id: &ExportId) -> Result<ExportRecord> {
        self.tracker.status(id).await
    }

    pub async fn history(&self, filter: RecordFilter) -> Result<Vec<ExportRecord>> {
        self.tracker.list(filter).await
    }

    fn downloadable_record(record: ExportRecord) -> Result<ExportRecord> {
        if record.state != ExportState::Completed {
            return Err(ExportError::validation(format!(
                "export {} is {}, not completed",
                record.id, record.state
            )));
        }
        Ok(record)
    }

    /// Download metadata with an optional signed URL. The guard's download
    /// check runs before anything touches the store.
    pub async fn download_metadata(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        id: &ExportId,
        url_ttl: Duration,
    ) -> Result<DownloadInfo> {
        let record = self.tracker.status(id).await?;
        if let Some(guard) = &self.guard {
            guard.authorize_download(actor, &record).await?;
        }
        let record = Self::downloadable_record(record)?;
        let artifact = record
            .artifact
            .clone()
            .ok_or_else(|| ExportError::not_found(format!("artifact for export {id}")))?;

        let signed_url = match self.store.signed_url(ctx, &artifact.key, url_ttl).await {
            Ok(url) => Some(url),
            Err(e) if e.kind() == ErrorKind::NotImplemented => None,
            Err(e) => return Err(e.at(Stage::Store)),
        };
        Ok(DownloadInfo {
            expires_at: record.expires_at,
            record,
            artifact,
            signed_url,
        })
    }

    /// Open the artifact byte stream for a completed export, enforcing the
    /// download guard first.
    pub async fn open_artifact(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        id: &ExportId,
    ) -> Result<(BoxArtifactReader, ArtifactMeta)> {
        let record = self.tracker.status(id).await?;
        if let Some(guard) = &self.guard {
            guard.authorize_download(actor, &record).await?;
        }
        let record = Self::downloadable_record(record)?;
        let artifact = record
            .artifact
            .as_ref()
            .ok_or_else(|| ExportError::not_found(format!("artifact for export {id}")))?;
        self.store
            .store()
            .open(ctx, &artifact.key)
            .await
            .at_stage(Stage::Store)
    }

    /// Remove expired terminal exports: delete the artifact (best-effort)
    /// and mark the record `deleted`. Returns how many records were removed.
    pub async fn cleanup(&self, ctx: &ExecContext, now: DateTime<Utc>) -> Result<u64> {
        let records = self.tracker.list(RecordFilter::default()).await?;
        let mut removed = 0u64;
        for record in records {
            if !record.state.is_terminal() || record.state == ExportState::Deleted {
                continue;
            }
            let Some(expires_at) = record.expires_at else {
                continue;
            };
            if expires_at > now {
                continue;
            }
            if let Some(artifact) = &record.artifact {
                if let Err(e) = self.store.store().delete(ctx, &artifact.key).await {
                    // Best-effort: the record still transitions to deleted.
                    tracing::warn!(
                        export_id = %record.id,
                        error = %e,
                        "failed to delete expired artifact"
                    );
                }
            }
            self.tracker.delete(&record.id).await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired exports");
        }
        Ok(removed)
    }
}
