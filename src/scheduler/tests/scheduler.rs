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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outflow_common::row;
use outflow_common::schema::{Column, DataType, Schema};
use outflow_common::types::{Actor, ExportRequest, ExportState, Format, ResolvedDefinition};
use outflow_common::{ErrorKind, ExecContext, ExportError, Result};
use outflow_connector::source::{
    channel_source, BoxRowIterator, CallbackSource, FnIterator, MemorySource,
};
use outflow_object_store::{ArtifactStoreImpl, ArtifactStoreMetrics, SignedArtifactStore};
use outflow_scheduler::{
    Backoff, Enqueuer, ExecutionHandler, ExecutionMessage, ExportScheduler, GenerateExportCommand,
    GenerateTask, MemoryIdempotencyStore, RetryPolicy, ServiceHandler,
};
use outflow_service::{ExportService, ServiceRef};
use outflow_tracker::MemoryTracker;
use parking_lot::Mutex;

fn users_definition() -> ResolvedDefinition {
    ResolvedDefinition {
        name: "users".into(),
        row_source_key: "users_source".into(),
        schema: Schema::new(vec![
            Column::new("id", DataType::Int),
            Column::new("name", DataType::String),
        ]),
        default_render_options: Default::default(),
    }
}

fn service_with_metrics() -> (ServiceRef, Arc<ArtifactStoreMetrics>) {
    let metrics = Arc::new(ArtifactStoreMetrics::unused());
    let store = Arc::new(SignedArtifactStore::new(ArtifactStoreImpl::in_memory(
        metrics.clone(),
    )));
    let service = Arc::new(ExportService::new(Arc::new(MemoryTracker::new()), store));
    service
        .definitions()
        .register("users", users_definition())
        .unwrap();
    (service, metrics)
}

#[derive(Default)]
struct RecordingEnqueuer {
    messages: Mutex<Vec<ExecutionMessage>>,
}

impl RecordingEnqueuer {
    fn count(&self) -> usize {
        self.messages.lock().len()
    }

    fn last(&self) -> ExecutionMessage {
        self.messages.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl Enqueuer for RecordingEnqueuer {
    async fn enqueue(&self, _ctx: &ExecContext, message: &ExecutionMessage) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

struct CountingHandler {
    inner: ServiceHandler,
    executes: Arc<AtomicU32>,
}

impl CountingHandler {
    fn new(service: ServiceRef) -> (Arc<Self>, Arc<AtomicU32>) {
        let executes = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                inner: ServiceHandler::new(service),
                executes: executes.clone(),
            }),
            executes,
        )
    }
}

#[async_trait]
impl ExecutionHandler for CountingHandler {
    async fn execute(&self, ctx: &ExecContext, command: &GenerateExportCommand) -> Result<()> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(ctx, command).await
    }

    async fn finalize_failure(&self, command: &GenerateExportCommand, error: &ExportError) {
        self.inner.finalize_failure(command, error).await;
    }

    async fn finalize_cancel(&self, command: &GenerateExportCommand) {
        self.inner.finalize_cancel(command).await;
    }

    async fn cleanup_artifact(&self, command: &GenerateExportCommand) {
        self.inner.cleanup_artifact(command).await;
    }
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries).with_backoff(Backoff::fixed(Duration::from_millis(1)))
}

/// Async + idempotency: identical requests with one key share one export and
/// enqueue exactly once.
#[tokio::test]
async fn test_idempotent_requests_enqueue_once() {
    let (service, _) = service_with_metrics();
    service
        .sources()
        .register(
            "users_source",
            Arc::new(MemorySource::new(vec![row![1i64, "alice"]])),
        )
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone())
        .with_idempotency(Arc::new(MemoryIdempotencyStore::new()));

    let ctx = ExecContext::new();
    let actor = Actor::new("tester");
    let request = ExportRequest::new("users", Format::Csv).with_idempotency_key("abc123");

    let first = scheduler
        .request_export(&ctx, &actor, request.clone())
        .await
        .unwrap();
    assert!(!first.reused);

    let second = scheduler
        .request_export(&ctx, &actor, request.clone())
        .await
        .unwrap();
    assert!(second.reused);
    assert_eq!(first.record.id, second.record.id);
    assert_eq!(enqueuer.count(), 1);

    // A different key is a different export.
    let third = scheduler
        .request_export(
            &ctx,
            &actor,
            ExportRequest::new("users", Format::Csv).with_idempotency_key("other"),
        )
        .await
        .unwrap();
    assert!(!third.reused);
    assert_ne!(third.record.id, first.record.id);
    assert_eq!(enqueuer.count(), 2);
}

#[tokio::test]
async fn test_requests_without_key_never_dedup() {
    let (service, _) = service_with_metrics();
    service
        .sources()
        .register("users_source", Arc::new(MemorySource::new(vec![])))
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service, enqueuer.clone())
        .with_idempotency(Arc::new(MemoryIdempotencyStore::new()));

    let ctx = ExecContext::new();
    let actor = Actor::new("tester");
    let a = scheduler
        .request_export(&ctx, &actor, ExportRequest::new("users", Format::Csv))
        .await
        .unwrap();
    let b = scheduler
        .request_export(&ctx, &actor, ExportRequest::new("users", Format::Csv))
        .await
        .unwrap();
    assert_ne!(a.record.id, b.record.id);
    assert_eq!(enqueuer.count(), 2);
}

/// End to end through the task: the queued message executes and completes
/// the record with a stored artifact.
#[tokio::test]
async fn test_task_executes_queued_export() {
    let (service, _) = service_with_metrics();
    service
        .sources()
        .register(
            "users_source",
            Arc::new(MemorySource::new(vec![row![1i64, "alice"]])),
        )
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone());

    let ctx = ExecContext::new();
    let actor = Actor::new("tester");
    let outcome = scheduler
        .request_export(&ctx, &actor, ExportRequest::new("users", Format::Csv))
        .await
        .unwrap();
    assert_eq!(outcome.record.state, ExportState::Queued);

    let (handler, executes) = CountingHandler::new(service.clone());
    let task = GenerateTask::new(handler, service.cancels().clone());
    task.execute(&ctx, &enqueuer.last()).await.unwrap();

    assert_eq!(executes.load(Ordering::SeqCst), 1);
    let record = service.status(&outcome.record.id).await.unwrap();
    assert_eq!(record.state, ExportState::Completed);
    assert!(record.artifact.is_some());
}

/// Retry with cleanup: two retryable failures then success. The task
/// dispatches three attempts and deletes the partial artifact once per
/// failed attempt.
#[tokio::test]
async fn test_retry_cleans_partial_artifacts() {
    let (service, metrics) = service_with_metrics();
    let opens = Arc::new(AtomicU32::new(0));
    let source_opens = opens.clone();
    service
        .sources()
        .register(
            "users_source",
            Arc::new(CallbackSource::new(move |ctx, _spec| {
                let attempt = source_opens.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    Ok(Box::new(FnIterator::new(ctx.clone(), || {
                        Err(ExportError::timeout("upstream flaked"))
                    })) as BoxRowIterator)
                } else {
                    let mut rows = vec![row![1i64, "alice"]].into_iter();
                    Ok(Box::new(FnIterator::new(ctx.clone(), move || Ok(rows.next())))
                        as BoxRowIterator)
                }
            })),
        )
        .unwrap();

    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone());
    let ctx = ExecContext::new();
    let outcome = scheduler
        .request_export(
            &ctx,
            &Actor::new("tester"),
            ExportRequest::new("users", Format::Csv),
        )
        .await
        .unwrap();

    let (handler, executes) = CountingHandler::new(service.clone());
    let task = GenerateTask::new(handler, service.cancels().clone()).with_policy(fast_policy(2));
    task.execute(&ctx, &enqueuer.last()).await.unwrap();

    assert_eq!(executes.load(Ordering::SeqCst), 3);
    // One artifact delete per failed attempt.
    assert_eq!(
        metrics
            .operation_latency
            .with_label_values(&["mem", "delete"])
            .get_sample_count(),
        2
    );
    let record = service.status(&outcome.record.id).await.unwrap();
    assert_eq!(record.state, ExportState::Completed);
}

/// `max_retries = k` dispatches exactly `k + 1` attempts before failing the
/// record.
#[tokio::test]
async fn test_exhausted_retries_fail_record() {
    let (service, _) = service_with_metrics();
    service
        .sources()
        .register(
            "users_source",
            Arc::new(CallbackSource::from_fn(|| {
                Err::<Option<outflow_common::Row>, _>(ExportError::internal("always broken"))
            })),
        )
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone());
    let ctx = ExecContext::new();
    let outcome = scheduler
        .request_export(
            &ctx,
            &Actor::new("tester"),
            ExportRequest::new("users", Format::Csv),
        )
        .await
        .unwrap();

    let (handler, executes) = CountingHandler::new(service.clone());
    let task = GenerateTask::new(handler, service.cancels().clone()).with_policy(fast_policy(2));
    let err = task.execute(&ctx, &enqueuer.last()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(executes.load(Ordering::SeqCst), 3);
    let record = service.status(&outcome.record.id).await.unwrap();
    assert_eq!(record.state, ExportState::Failed);
    assert!(record.error.unwrap().contains("always broken"));
}

#[tokio::test]
async fn test_non_retryable_error_dispatches_once() {
    let (service, _) = service_with_metrics();
    // Rows one value short of the schema: a validation failure.
    service
        .sources()
        .register(
            "users_source",
            Arc::new(MemorySource::new(vec![row![1i64]])),
        )
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone());
    let ctx = ExecContext::new();
    let outcome = scheduler
        .request_export(
            &ctx,
            &Actor::new("tester"),
            ExportRequest::new("users", Format::Csv),
        )
        .await
        .unwrap();

    let (handler, executes) = CountingHandler::new(service.clone());
    let task = GenerateTask::new(handler, service.cancels().clone()).with_policy(fast_policy(5));
    let err = task.execute(&ctx, &enqueuer.last()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(executes.load(Ordering::SeqCst), 1);
    assert_eq!(
        service.status(&outcome.record.id).await.unwrap().state,
        ExportState::Failed
    );
}

/// A canceled execution is never retried, and the record terminates as
/// canceled.
#[tokio::test]
async fn test_cancel_stops_retries() {
    let (service, _) = service_with_metrics();
    let (source, tx) = channel_source(1);
    service
        .sources()
        .register("users_source", Arc::new(source))
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone());
    let ctx = ExecContext::new();
    let outcome = scheduler
        .request_export(
            &ctx,
            &Actor::new("tester"),
            ExportRequest::new("users", Format::Csv),
        )
        .await
        .unwrap();

    let (handler, executes) = CountingHandler::new(service.clone());
    let task = Arc::new(
        GenerateTask::new(handler, service.cancels().clone()).with_policy(fast_policy(5)),
    );
    let message = enqueuer.last();
    let task_ctx = ctx.clone();
    let running = tokio::spawn({
        let task = task.clone();
        async move { task.execute(&task_ctx, &message).await }
    });

    // Let the worker block on the silent source, then cancel through the
    // service as a client would.
    tokio::time::sleep(Duration::from_millis(50)).await;
    service
        .cancel_export(&Actor::new("tester"), &outcome.record.id)
        .await
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("cancellation must be observed within 2s")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert_eq!(executes.load(Ordering::SeqCst), 1);
    assert_eq!(
        service.status(&outcome.record.id).await.unwrap().state,
        ExportState::Canceled
    );
    drop(tx);
}

/// A terminally failed export does not satisfy idempotent reuse; the next
/// request with the same key builds a fresh export.
#[tokio::test]
async fn test_failed_export_is_not_reused() {
    let (service, _) = service_with_metrics();
    service
        .sources()
        .register(
            "users_source",
            Arc::new(CallbackSource::from_fn(|| {
                Err::<Option<outflow_common::Row>, _>(ExportError::validation("broken rows"))
            })),
        )
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone())
        .with_idempotency(Arc::new(MemoryIdempotencyStore::new()));

    let ctx = ExecContext::new();
    let actor = Actor::new("tester");
    let request = ExportRequest::new("users", Format::Csv).with_idempotency_key("abc123");
    let first = scheduler
        .request_export(&ctx, &actor, request.clone())
        .await
        .unwrap();

    let (handler, _) = CountingHandler::new(service.clone());
    let task = GenerateTask::new(handler, service.cancels().clone())
        .with_policy(RetryPolicy::no_retry());
    let _ = task.execute(&ctx, &enqueuer.last()).await;
    assert_eq!(
        service.status(&first.record.id).await.unwrap().state,
        ExportState::Failed
    );

    let second = scheduler
        .request_export(&ctx, &actor, request)
        .await
        .unwrap();
    assert!(!second.reused);
    assert_ne!(second.record.id, first.record.id);
    assert_eq!(enqueuer.count(), 2);
}

/// A second worker picking up the same export is rejected before it can
/// dispatch anything.
#[tokio::test]
async fn test_duplicate_worker_conflicts() {
    let (service, _) = service_with_metrics();
    service
        .sources()
        .register("users_source", Arc::new(MemorySource::new(vec![])))
        .unwrap();
    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let scheduler = ExportScheduler::new(service.clone(), enqueuer.clone());
    let ctx = ExecContext::new();
    let outcome = scheduler
        .request_export(
            &ctx,
            &Actor::new("tester"),
            ExportRequest::new("users", Format::Csv),
        )
        .await
        .unwrap();

    // First worker holds the registration.
    let _registration = service
        .cancels()
        .clone()
        .register(outcome.record.id.clone(), ctx.child())
        .unwrap();

    let (handler, executes) = CountingHandler::new(service.clone());
    let task = GenerateTask::new(handler, service.cancels().clone());
    let err = task.execute(&ctx, &enqueuer.last()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(executes.load(Ordering::SeqCst), 0);
}
