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

use outflow_common::types::{Actor, Delivery, ExportId, ExportRecord, ExportRequest, ExportState};
use outflow_common::{ExecContext, ExportError, Result};
use outflow_service::ServiceRef;
use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::idempotency::{request_signature, IdempotencyStore};

/// Script identifier the job executor maps to the generate task.
pub const GENERATE_SCRIPT_PATH: &str = "exports:generate";

/// How the queue treats messages sharing an idempotency key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize,
)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DedupPolicy {
    #[default]
    Merge,
}

/// Everything the worker needs to run one export, encoded portably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub export_id: ExportId,
    pub actor: Actor,
    pub request: ExportRequest,
}

impl JobPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ExportError::validation(format!("malformed job payload: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageParameters {
    pub payload: Vec<u8>,
}

/// The job execution message handed to the queue. Opaque to the queue except
/// for the routing and dedup fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub job_id: String,
    pub script_path: String,
    pub parameters: MessageParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub dedup_policy: DedupPolicy,
}

/// What [`MessageBuilder::build`] produced: either a fresh record plus the
/// message to enqueue, or a reused record matched by idempotency signature.
pub struct BuildOutcome {
    pub record: ExportRecord,
    pub reused: bool,
    pub message: Option<ExecutionMessage>,
    pub signature: Option<String>,
}

/// Builds and deduplicates job execution messages. Delivery is forced to
/// async; a signature hit on a live record short-circuits without touching
/// the tracker.
pub struct MessageBuilder {
    service: ServiceRef,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
}

impl MessageBuilder {
    pub fn new(service: ServiceRef) -> Self {
        Self {
            service,
            idempotency: None,
        }
    }

    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    fn reusable(state: ExportState) -> bool {
        matches!(
            state,
            ExportState::Queued | ExportState::Running | ExportState::Completed
        )
    }

    pub async fn build(
        &self,
        ctx: &ExecContext,
        actor: &Actor,
        mut request: ExportRequest,
    ) -> Result<BuildOutcome> {
        request.delivery = Delivery::Async;

        let signature = match (&request.idempotency_key, &self.idempotency) {
            (Some(key), Some(_)) => Some(request_signature(key, actor, &request)),
            _ => None,
        };

        if let (Some(signature), Some(store)) = (&signature, &self.idempotency) {
            if let Some(export_id) = store.get(signature) {
                match self.service.status(&export_id).await {
                    Ok(record) if Self::reusable(record.state) => {
                        tracing::debug!(
                            export_id = %record.id,
                            "reusing export for idempotent request"
                        );
                        return Ok(BuildOutcome {
                            record,
                            reused: true,
                            message: None,
                            signature: Some(signature.clone()),
                        });
                    }
                    // Canceled, failed, deleted or vanished: build afresh.
                    Ok(_) | Err(_) => store.remove(signature),
                }
            }
        }

        let record = self
            .service
            .request_export(ctx, actor, request.clone(), None)
            .await?;
        let payload = JobPayload {
            export_id: record.id.clone(),
            actor: actor.clone(),
            request: request.clone(),
        }
        .encode()?;

        let message = ExecutionMessage {
            job_id: uuid::Uuid::new_v4().to_string(),
            script_path: GENERATE_SCRIPT_PATH.to_owned(),
            parameters: MessageParameters { payload },
            idempotency_key: request.idempotency_key.clone(),
            dedup_policy: DedupPolicy::Merge,
        };
        Ok(BuildOutcome {
            record,
            reused: false,
            message: Some(message),
            signature,
        })
    }
}
