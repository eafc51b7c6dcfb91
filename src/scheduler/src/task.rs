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

use async_trait::async_trait;
use outflow_common::types::{Actor, ExportId, ExportRequest};
use outflow_common::{ExecContext, ExportError, Result};
use outflow_service::{CancelRegistry, ServiceRef};
use serde::{Deserialize, Serialize};

use crate::message::{ExecutionMessage, JobPayload};
use crate::retry::RetryPolicy;

/// The decoded work order a worker executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateExportCommand {
    pub export_id: ExportId,
    pub actor: Actor,
    pub request: ExportRequest,
}

/// Command execution seam between the task and the service. Explicit so the
/// scheduler never reaches for process-wide dispatch state, and so tests can
/// substitute the execution side wholesale.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    /// Run one attempt. Finalizing a failed record stays with the caller,
    /// which knows whether the failure is final.
    async fn execute(&self, ctx: &ExecContext, command: &GenerateExportCommand) -> Result<()>;

    /// Mark the record terminally failed after retries are exhausted.
    async fn finalize_failure(&self, command: &GenerateExportCommand, error: &ExportError);

    /// Mark the record canceled.
    async fn finalize_cancel(&self, command: &GenerateExportCommand);

    /// Best-effort removal of a partial artifact between attempts.
    async fn cleanup_artifact(&self, command: &GenerateExportCommand);
}

/// [`ExecutionHandler`] backed by the export service.
pub struct ServiceHandler {
    service: ServiceRef,
}

impl ServiceHandler {
    pub fn new(service: ServiceRef) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ExecutionHandler for ServiceHandler {
    async fn execute(&self, ctx: &ExecContext, command: &GenerateExportCommand) -> Result<()> {
        self.service
            .execute_attempt(ctx, &command.actor, &command.export_id, &command.request)
            .await
            .map(|_| ())
    }

    async fn finalize_failure(&self, command: &GenerateExportCommand, error: &ExportError) {
        self.service
            .finalize_failure(&command.export_id, error)
            .await;
    }

    async fn finalize_cancel(&self, command: &GenerateExportCommand) {
        self.service
            .finalize_cancel(&command.export_id, command.request.format)
            .await;
    }

    async fn cleanup_artifact(&self, command: &GenerateExportCommand) {
        self.service
            .discard_artifact(&command.export_id, command.request.format)
            .await;
    }
}

/// Worker-side executor of generate messages: decodes the payload, registers
/// a cancel handle for the export, and drives attempts under the retry
/// policy. `max_retries = k` dispatches at most `k + 1` attempts.
pub struct GenerateTask {
    handler: Arc<dyn ExecutionHandler>,
    cancels: Arc<CancelRegistry>,
    policy: RetryPolicy,
}

impl GenerateTask {
    pub fn new(handler: Arc<dyn ExecutionHandler>, cancels: Arc<CancelRegistry>) -> Self {
        Self {
            handler,
            cancels,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn execute(&self, ctx: &ExecContext, message: &ExecutionMessage) -> Result<()> {
        let payload = JobPayload::decode(&message.parameters.payload)?;
        let command = GenerateExportCommand {
            export_id: payload.export_id,
            actor: payload.actor,
            request: payload.request,
        };

        let exec_ctx = ctx.child();
        // Registered for the whole task, released on every exit path when
        // the registration drops. A duplicate registration means another
        // worker is already on this export.
        let _registration = self
            .cancels
            .clone()
            .register(command.export_id.clone(), exec_ctx.clone())?;

        tracing::debug!(
            export_id = %command.export_id,
            job_id = %message.job_id,
            "executing generate message"
        );
        self.run_attempts(&exec_ctx, &command).await
    }

    async fn run_attempts(
        &self,
        ctx: &ExecContext,
        command: &GenerateExportCommand,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(e) = ctx.err() {
                self.finalize(command, &e).await;
                return Err(e);
            }

            let error = match self.handler.execute(ctx, command).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !self.policy.should_retry(&error) || attempt >= self.policy.max_retries {
                self.finalize(command, &error).await;
                return Err(error);
            }

            self.handler.cleanup_artifact(command).await;
            attempt += 1;
            let delay = self.policy.backoff.delay(attempt);
            tracing::info!(
                export_id = %command.export_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying export generation"
            );
            if let Err(ctx_err) = ctx.sleep(delay).await {
                self.finalize(command, &ctx_err).await;
                return Err(ctx_err);
            }
        }
    }

    async fn finalize(&self, command: &GenerateExportCommand, error: &ExportError) {
        if error.is_canceled() {
            self.handler.finalize_cancel(command).await;
        } else {
            self.handler.finalize_failure(command, error).await;
        }
    }
}
