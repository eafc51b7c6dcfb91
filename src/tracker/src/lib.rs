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

//! Durable state for export records: the tracker owns the record lifecycle
//! and enforces the state machine. Adapters differ only in where the records
//! live; the transition rules are shared here so memory and relational
//! backends cannot drift apart.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outflow_common::types::{ArtifactRef, ExportId, ExportRecord, ExportState};
use outflow_common::{ExportError, Result};

pub mod mem;
pub use mem::*;

pub mod sqlite;
pub use sqlite::*;

pub type TrackerRef = Arc<dyn ExportTracker>;

/// Counter increments applied by [`ExportTracker::advance`]. All fields are
/// deltas, never absolute values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceDelta {
    pub rows: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Authoritative totals reported on completion. `None` keeps the counters
/// accumulated through `advance`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompleteStats {
    pub rows: Option<u64>,
    pub bytes: Option<u64>,
}

/// Filter for [`ExportTracker::list`]. All fields are conjunctive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub definition: Option<String>,
    pub state: Option<ExportState>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn matches(&self, record: &ExportRecord) -> bool {
        if let Some(definition) = &self.definition {
            if &record.definition != definition {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at > until {
                return false;
            }
        }
        true
    }
}

/// Apply `next` to `record`, enforcing the state machine.
///
/// `started_at` is stamped once on the first transition to `running`,
/// `completed_at` once on the first non-delete terminal transition. A
/// transition out of a terminal state is a conflict; any other disallowed
/// edge is a validation error.
pub fn apply_transition(
    record: &mut ExportRecord,
    next: ExportState,
    now: DateTime<Utc>,
) -> Result<()> {
    if !record.state.can_transition_to(next) {
        let message = format!(
            "export {} cannot transition {} -> {}",
            record.id, record.state, next
        );
        return Err(if record.state.is_terminal() {
            ExportError::conflict(message)
        } else {
            ExportError::validation(message)
        });
    }
    if next == ExportState::Running && record.started_at.is_none() {
        record.started_at = Some(now);
    }
    if next.is_terminal() && next != ExportState::Deleted && record.completed_at.is_none() {
        record.completed_at = Some(now);
    }
    record.state = next;
    Ok(())
}

/// Fold completion stats into the record, keeping counters monotonic.
pub fn apply_complete_stats(record: &mut ExportRecord, stats: CompleteStats) {
    if let Some(rows) = stats.rows {
        record.counts.processed = record.counts.processed.max(rows);
    }
    if let Some(bytes) = stats.bytes {
        record.bytes_written = record.bytes_written.max(bytes);
    }
}

/// Durable record store for exports.
///
/// Mutations are atomic per record and serialized per id; concurrent
/// `advance` calls are additive. `counts.processed` and `bytes_written`
/// never decrease over a record's life.
#[async_trait]
pub trait ExportTracker: Send + Sync {
    /// Persist a fresh record. The state is forced to `queued` and
    /// `created_at` is stamped; the caller-assigned id is kept. The record
    /// is durable when this returns. An existing id is a conflict.
    async fn start(&self, record: ExportRecord) -> Result<ExportId>;

    /// Atomically add `delta` to the record's counters.
    async fn advance(&self, id: &ExportId, delta: AdvanceDelta) -> Result<()>;

    /// Drive the record through one state machine edge.
    async fn set_state(&self, id: &ExportId, state: ExportState) -> Result<ExportRecord>;

    /// Terminal `failed` with the error message recorded.
    async fn fail(&self, id: &ExportId, message: &str) -> Result<ExportRecord>;

    /// Terminal `completed`, folding in authoritative totals.
    async fn complete(&self, id: &ExportId, stats: CompleteStats) -> Result<ExportRecord>;

    /// Record the stored artifact; adopts the artifact's expiry as the
    /// record expiry when present.
    async fn set_artifact(&self, id: &ExportId, artifact: ArtifactRef) -> Result<()>;

    async fn status(&self, id: &ExportId) -> Result<ExportRecord>;

    /// Matching records, newest first.
    async fn list(&self, filter: RecordFilter) -> Result<Vec<ExportRecord>>;

    /// Replace the stored record wholesale. The state machine is not
    /// consulted; callers own the consistency of what they write.
    async fn update(&self, record: ExportRecord) -> Result<()>;

    /// Terminal `deleted`. Deleting an already-deleted record is a no-op.
    async fn delete(&self, id: &ExportId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use outflow_common::types::{Actor, ExportRequest, Format};

    use super::*;

    fn record() -> ExportRecord {
        ExportRecord::new(
            ExportId::new(),
            &ExportRequest::new("users", Format::Csv),
            &Actor::new("tester"),
        )
    }

    #[test]
    fn test_started_at_stamped_once() {
        let mut r = record();
        let t0 = Utc::now();
        apply_transition(&mut r, ExportState::Running, t0).unwrap();
        assert_eq!(r.started_at, Some(t0));

        // Completing later must not touch started_at.
        let t1 = t0 + chrono::Duration::seconds(5);
        apply_transition(&mut r, ExportState::Completed, t1).unwrap();
        assert_eq!(r.started_at, Some(t0));
        assert_eq!(r.completed_at, Some(t1));
    }

    #[test]
    fn test_terminal_transition_is_conflict() {
        let mut r = record();
        apply_transition(&mut r, ExportState::Canceled, Utc::now()).unwrap();
        let err = apply_transition(&mut r, ExportState::Running, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), outflow_common::ErrorKind::Conflict);
    }

    #[test]
    fn test_invalid_edge_is_validation() {
        let mut r = record();
        let err = apply_transition(&mut r, ExportState::Completed, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), outflow_common::ErrorKind::Validation);
    }

    #[test]
    fn test_delete_does_not_stamp_completed_at() {
        let mut r = record();
        apply_transition(&mut r, ExportState::Deleted, Utc::now()).unwrap();
        assert_eq!(r.completed_at, None);
    }

    #[test]
    fn test_complete_stats_keep_monotonicity() {
        let mut r = record();
        r.counts.processed = 10;
        r.bytes_written = 100;
        apply_complete_stats(
            &mut r,
            CompleteStats {
                rows: Some(4),
                bytes: Some(400),
            },
        );
        assert_eq!(r.counts.processed, 10);
        assert_eq!(r.bytes_written, 400);
    }

    #[test]
    fn test_filter_matching() {
        let r = record();
        assert!(RecordFilter::default().matches(&r));
        assert!(RecordFilter {
            definition: Some("users".into()),
            ..Default::default()
        }
        .matches(&r));
        assert!(!RecordFilter {
            definition: Some("orders".into()),
            ..Default::default()
        }
        .matches(&r));
        assert!(!RecordFilter {
            state: Some(ExportState::Running),
            ..Default::default()
        }
        .matches(&r));
        assert!(!RecordFilter {
            until: Some(r.created_at - chrono::Duration::seconds(1)),
            ..Default::default()
        }
        .matches(&r));
    }
}
