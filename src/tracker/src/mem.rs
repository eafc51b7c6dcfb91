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

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use outflow_common::types::{ArtifactRef, ExportId, ExportRecord, ExportState};
use outflow_common::{ExportError, Result};
use parking_lot::Mutex;

use crate::{
    apply_complete_stats, apply_transition, AdvanceDelta, CompleteStats, ExportTracker,
    RecordFilter,
};

/// In-memory tracker. One lock over the record map serializes mutations,
/// which trivially satisfies the per-record atomicity contract.
#[derive(Default)]
pub struct MemoryTracker {
    records: Mutex<HashMap<ExportId, ExportRecord>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<T>(
        &self,
        id: &ExportId,
        f: impl FnOnce(&mut ExportRecord) -> Result<T>,
    ) -> Result<T> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| ExportError::not_found(format!("export {id}")))?;
        f(record)
    }
}

#[async_trait]
impl ExportTracker for MemoryTracker {
    async fn start(&self, mut record: ExportRecord) -> Result<ExportId> {
        record.state = ExportState::Queued;
        record.created_at = Utc::now();
        let id = record.id.clone();
        let mut records = self.records.lock();
        if records.contains_key(&id) {
            return Err(ExportError::conflict(format!(
                "export {id} is already tracked"
            )));
        }
        records.insert(id.clone(), record);
        Ok(id)
    }

    async fn advance(&self, id: &ExportId, delta: AdvanceDelta) -> Result<()> {
        self.mutate(id, |record| {
            record.counts.processed += delta.rows;
            record.counts.errors += delta.errors;
            record.bytes_written += delta.bytes;
            Ok(())
        })
    }

    async fn set_state(&self, id: &ExportId, state: ExportState) -> Result<ExportRecord> {
        self.mutate(id, |record| {
            apply_transition(record, state, Utc::now())?;
            Ok(record.clone())
        })
    }

    async fn fail(&self, id: &ExportId, message: &str) -> Result<ExportRecord> {
        self.mutate(id, |record| {
            apply_transition(record, ExportState::Failed, Utc::now())?;
            record.error = Some(message.to_owned());
            Ok(record.clone())
        })
    }

    async fn complete(&self, id: &ExportId, stats: CompleteStats) -> Result<ExportRecord> {
        self.mutate(id, |record| {
            apply_transition(record, ExportState::Completed, Utc::now())?;
            apply_complete_stats(record, stats);
            Ok(record.clone())
        })
    }

    async fn set_artifact(&self, id: &ExportId, artifact: ArtifactRef) -> Result<()> {
        self.mutate(id, |record| {
            if let Some(expires_at) = artifact.meta.expires_at {
                record.expires_at = Some(expires_at);
            }
            record.artifact = Some(artifact);
            Ok(())
        })
    }

    async fn status(&self, id: &ExportId) -> Result<ExportRecord> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ExportError::not_found(format!("export {id}")))
    }

    async fn list(&self, filter: RecordFilter) -> Result<Vec<ExportRecord>> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn update(&self, record: ExportRecord) -> Result<()> {
        let mut records = self.records.lock();
        match records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(ExportError::not_found(format!("export {}", record.id))),
        }
    }

    async fn delete(&self, id: &ExportId) -> Result<()> {
        self.mutate(id, |record| {
            if record.state == ExportState::Deleted {
                return Ok(());
            }
            apply_transition(record, ExportState::Deleted, Utc::now())
        })
    }
}
