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
use chrono::{DateTime, SecondsFormat, Utc};
use outflow_common::types::{ArtifactRef, ExportId, ExportRecord, ExportState};
use outflow_common::{ExportError, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row};

use crate::{
    apply_complete_stats, apply_transition, AdvanceDelta, CompleteStats, ExportTracker,
    RecordFilter,
};

/// Relational tracker adapter on SQLite. Each mutation runs in a transaction
/// that re-reads the record, applies the shared transition rules and writes
/// it back, so the state machine is enforced identically to the in-memory
/// adapter.
pub struct SqliteTracker {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> ExportError {
    ExportError::Internal(anyhow::Error::new(e))
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    // Fixed-width UTC timestamps order lexicographically, which the
    // created_at comparisons in `list` rely on; nanosecond precision keeps
    // the round-trip lossless.
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ExportError::internal(format!("corrupt timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<ExportRecord> {
    let state: String = row.try_get("state").map_err(db_err)?;
    let format: String = row.try_get("format").map_err(db_err)?;
    let requested_by: String = row.try_get("requested_by").map_err(db_err)?;
    let scope: String = row.try_get("scope").map_err(db_err)?;
    let artifact: Option<String> = row.try_get("artifact").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;

    Ok(ExportRecord {
        id: ExportId::from(row.try_get::<String, _>("id").map_err(db_err)?),
        definition: row.try_get("definition").map_err(db_err)?,
        format: format
            .parse()
            .map_err(|_| ExportError::internal(format!("corrupt format {format:?}")))?,
        state: state
            .parse()
            .map_err(|_| ExportError::internal(format!("corrupt state {state:?}")))?,
        requested_by: serde_json::from_str(&requested_by)?,
        scope: serde_json::from_str(&scope)?,
        counts: outflow_common::types::Counts {
            processed: row.try_get::<i64, _>("processed").map_err(db_err)? as u64,
            total: row
                .try_get::<Option<i64>, _>("total")
                .map_err(db_err)?
                .map(|n| n as u64),
            errors: row.try_get::<i64, _>("errors").map_err(db_err)? as u64,
        },
        bytes_written: row.try_get::<i64, _>("bytes_written").map_err(db_err)? as u64,
        artifact: artifact
            .as_deref()
            .map(serde_json::from_str::<ArtifactRef>)
            .transpose()?,
        error: row.try_get("error").map_err(db_err)?,
        created_at: parse_ts(&created_at)?,
        started_at: parse_opt_ts(row.try_get("started_at").map_err(db_err)?)?,
        completed_at: parse_opt_ts(row.try_get("completed_at").map_err(db_err)?)?,
        expires_at: parse_opt_ts(row.try_get("expires_at").map_err(db_err)?)?,
    })
}

impl SqliteTracker {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(db_err)?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database; the single connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let tracker = Self { pool };
        tracker.init_schema().await?;
        Ok(tracker)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS exports (
                id TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                format TEXT NOT NULL,
                state TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                scope TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                total INTEGER,
                errors INTEGER NOT NULL DEFAULT 0,
                bytes_written INTEGER NOT NULL DEFAULT 0,
                artifact TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                expires_at TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_exports_created_at ON exports (created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_record<'c, E>(executor: E, record: &ExportRecord) -> Result<u64>
    where
        E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE exports SET
                definition = ?, format = ?, state = ?, requested_by = ?, scope = ?,
                processed = ?, total = ?, errors = ?, bytes_written = ?,
                artifact = ?, error = ?, started_at = ?, completed_at = ?, expires_at = ?
             WHERE id = ?",
        )
        .bind(&record.definition)
        .bind(record.format.to_string())
        .bind(record.state.to_string())
        .bind(serde_json::to_string(&record.requested_by)?)
        .bind(serde_json::to_string(&record.scope)?)
        .bind(record.counts.processed as i64)
        .bind(record.counts.total.map(|n| n as i64))
        .bind(record.counts.errors as i64)
        .bind(record.bytes_written as i64)
        .bind(
            record
                .artifact
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&record.error)
        .bind(record.started_at.as_ref().map(fmt_ts))
        .bind(record.completed_at.as_ref().map(fmt_ts))
        .bind(record.expires_at.as_ref().map(fmt_ts))
        .bind(record.id.as_str())
        .execute(executor)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// Read-modify-write one record inside a transaction.
    async fn mutate<T, F>(&self, id: &ExportId, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut ExportRecord) -> Result<T> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT * FROM exports WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let mut record = match row {
            Some(row) => record_from_row(&row)?,
            None => return Err(ExportError::not_found(format!("export {id}"))),
        };
        let out = f(&mut record)?;
        Self::write_record(&mut *tx, &record).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(out)
    }
}

#[async_trait]
impl ExportTracker for SqliteTracker {
    async fn start(&self, mut record: ExportRecord) -> Result<ExportId> {
        record.state = ExportState::Queued;
        record.created_at = Utc::now();

        let result = sqlx::query(
            "INSERT OR IGNORE INTO exports (
                id, definition, format, state, requested_by, scope,
                processed, total, errors, bytes_written,
                artifact, error, created_at, started_at, completed_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.as_str())
        .bind(&record.definition)
        .bind(record.format.to_string())
        .bind(record.state.to_string())
        .bind(serde_json::to_string(&record.requested_by)?)
        .bind(serde_json::to_string(&record.scope)?)
        .bind(record.counts.processed as i64)
        .bind(record.counts.total.map(|n| n as i64))
        .bind(record.counts.errors as i64)
        .bind(record.bytes_written as i64)
        .bind(
            record
                .artifact
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&record.error)
        .bind(fmt_ts(&record.created_at))
        .bind(record.started_at.as_ref().map(fmt_ts))
        .bind(record.completed_at.as_ref().map(fmt_ts))
        .bind(record.expires_at.as_ref().map(fmt_ts))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(ExportError::conflict(format!(
                "export {} is already tracked",
                record.id
            )));
        }
        Ok(record.id)
    }

    async fn advance(&self, id: &ExportId, delta: AdvanceDelta) -> Result<()> {
        let result = sqlx::query(
            "UPDATE exports SET
                processed = processed + ?,
                errors = errors + ?,
                bytes_written = bytes_written + ?
             WHERE id = ?",
        )
        .bind(delta.rows as i64)
        .bind(delta.errors as i64)
        .bind(delta.bytes as i64)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(ExportError::not_found(format!("export {id}")));
        }
        Ok(())
    }

    async fn set_state(&self, id: &ExportId, state: ExportState) -> Result<ExportRecord> {
        self.mutate(id, |record| {
            apply_transition(record, state, Utc::now())?;
            Ok(record.clone())
        })
        .await
    }

    async fn fail(&self, id: &ExportId, message: &str) -> Result<ExportRecord> {
        self.mutate(id, |record| {
            apply_transition(record, ExportState::Failed, Utc::now())?;
            record.error = Some(message.to_owned());
            Ok(record.clone())
        })
        .await
    }

    async fn complete(&self, id: &ExportId, stats: CompleteStats) -> Result<ExportRecord> {
        self.mutate(id, |record| {
            apply_transition(record, ExportState::Completed, Utc::now())?;
            apply_complete_stats(record, stats);
            Ok(record.clone())
        })
        .await
    }

    async fn set_artifact(&self, id: &ExportId, artifact: ArtifactRef) -> Result<()> {
        self.mutate(id, |record| {
            if let Some(expires_at) = artifact.meta.expires_at {
                record.expires_at = Some(expires_at);
            }
            record.artifact = Some(artifact);
            Ok(())
        })
        .await
    }

    async fn status(&self, id: &ExportId) -> Result<ExportRecord> {
        let row = sqlx::query("SELECT * FROM exports WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => record_from_row(&row),
            None => Err(ExportError::not_found(format!("export {id}"))),
        }
    }

    async fn list(&self, filter: RecordFilter) -> Result<Vec<ExportRecord>> {
        let mut qb = QueryBuilder::new("SELECT * FROM exports WHERE 1 = 1");
        if let Some(definition) = &filter.definition {
            qb.push(" AND definition = ").push_bind(definition.clone());
        }
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.to_string());
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(fmt_ts(&since));
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at <= ").push_bind(fmt_ts(&until));
        }
        qb.push(" ORDER BY created_at DESC");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update(&self, record: ExportRecord) -> Result<()> {
        let affected = Self::write_record(&self.pool, &record).await?;
        if affected == 0 {
            return Err(ExportError::not_found(format!("export {}", record.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &ExportId) -> Result<()> {
        self.mutate(id, |record| {
            if record.state == ExportState::Deleted {
                return Ok(());
            }
            apply_transition(record, ExportState::Deleted, Utc::now())
        })
        .await
    }
}
