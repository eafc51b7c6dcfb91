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
use outflow_common::types::{Actor, ExportRecord, ExportRequest};
use outflow_common::{ExecContext, ExportError, Result};
use outflow_service::ServiceRef;

use crate::idempotency::IdempotencyStore;
use crate::message::{ExecutionMessage, MessageBuilder};

const DEFAULT_SIGNATURE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Hands execution messages to whatever queue runs the workers.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, ctx: &ExecContext, message: &ExecutionMessage) -> Result<()>;
}

/// What a schedule request produced.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub record: ExportRecord,
    /// An existing export was matched by idempotency signature; nothing was
    /// enqueued.
    pub reused: bool,
}

/// Async façade: builds the message, enqueues it, and persists the
/// idempotency signature once the enqueue succeeded.
pub struct ExportScheduler {
    builder: MessageBuilder,
    enqueuer: Arc<dyn Enqueuer>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    signature_ttl: Duration,
}

impl ExportScheduler {
    pub fn new(service: ServiceRef, enqueuer: Arc<dyn Enqueuer>) -> Self {
        Self {
            builder: MessageBuilder::new(service),
            enqueuer,
            idempotency: None,
            signature_ttl: DEFAULT_SIGNATURE_TTL,
        }
    }

    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.builder = self.builder.with_idempotency(store.clone());
        self.idempotency = Some(store);
        self
    }

    pub fn with_signature_ttl(mut self, ttl: Duration) -> Self {
        self.signature_ttl = ttl;
        self
    }

    /// Queue one export. A request carrying an already-seen idempotency key
    /// returns the existing record and enqueues nothing.
    pub async fn request_export(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        request: ExportRequest,
    ) -> Result<ScheduleOutcome> {
        let outcome = self.builder.build(ctx, actor, request).await?;
        if outcome.reused {
            return Ok(ScheduleOutcome {
                record: outcome.record,
                reused: true,
            });
        }

        let message = outcome.message.ok_or_else(|| {
            ExportError::internal("message builder returned neither reuse nor message")
        })?;
        self.enqueuer.enqueue(ctx, &message).await?;
        tracing::info!(
            export_id = %outcome.record.id,
            job_id = %message.job_id,
            "export enqueued"
        );

        // Only a successfully enqueued export may satisfy future idempotent
        // requests.
        if let (Some(signature), Some(store)) = (&outcome.signature, &self.idempotency) {
            store.put(signature, outcome.record.id.clone(), self.signature_ttl);
        }
        Ok(ScheduleOutcome {
            record: outcome.record,
            reused: false,
        })
    }
}
