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
use std::fmt;

use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::schema::Schema;

/// Identifier of a tracked export. Tracker adapters may accept caller-provided
/// ids; freshly minted ones are v4 UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(String);

impl ExportId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ExportId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExportId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Tenancy boundary injected into row sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

/// The requesting principal. Participates in authorization and scope
/// injection; travels inside the async job payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Target output format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize,
)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    Json,
    Xlsx,
    Sqlite,
    Html,
    Pdf,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
            Format::Xlsx => "xlsx",
            Format::Sqlite => "sqlite",
            Format::Html => "html",
            Format::Pdf => "pdf",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Csv => "text/csv",
            Format::Json => "application/json",
            Format::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            Format::Sqlite => "application/vnd.sqlite3",
            Format::Html => "text/html",
            Format::Pdf => "application/pdf",
        }
    }
}

/// How the caller wants the artifact delivered.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Display,
    FromStr,
    Serialize,
    Deserialize,
)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Sync,
    Async,
    #[default]
    Auto,
}

/// Which rows of the definition to export.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Selection {
    #[default]
    All,
    Ids {
        ids: Vec<String>,
    },
    Query {
        query: serde_json::Value,
    },
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Emit the header row.
    #[serde(default = "default_true")]
    pub header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            header: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonOptions {
    pub pretty: bool,
}

/// Strategy for template-style renderers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromStr, Serialize, Deserialize,
)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TemplateStrategy {
    /// Collect rows up front; bounded by `max_buffered_rows`.
    #[default]
    Buffered,
    /// Hand rows to the template through a bounded producer channel.
    Streaming,
}

fn default_max_buffered_rows() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub strategy: TemplateStrategy,
    #[serde(default = "default_max_buffered_rows")]
    pub max_buffered_rows: usize,
}

impl Default for HtmlOptions {
    fn default() -> Self {
        Self {
            title: None,
            strategy: TemplateStrategy::default(),
            max_buffered_rows: default_max_buffered_rows(),
        }
    }
}

/// Renderer options. Format-specific knobs are namespaced under the format's
/// own sub-struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Output timezone; resolved from the request when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Output locale; resolved from the request when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    pub csv: CsvOptions,
    pub json: JsonOptions,
    pub html: HtmlOptions,
}

fn default_locale() -> String {
    "en".to_owned()
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

/// Immutable export request. The synchronous output sink is not part of the
/// request; it is passed alongside it, since a writer cannot cross a job
/// payload boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub format: Format,
    #[serde(default)]
    pub delivery: Delivery,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_bytes: Option<u64>,
    #[serde(default)]
    pub render_options: RenderOptions,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl ExportRequest {
    pub fn new(definition: impl Into<String>, format: Format) -> Self {
        Self {
            definition: definition.into(),
            resource: None,
            format,
            delivery: Delivery::default(),
            selection: Selection::default(),
            columns: Vec::new(),
            query: None,
            idempotency_key: None,
            estimated_rows: None,
            estimated_bytes: None,
            render_options: RenderOptions::default(),
            locale: default_locale(),
            timezone: default_timezone(),
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.definition.is_empty() {
            return Err(ExportError::validation("definition must not be empty"));
        }
        if let Selection::Ids { ids } = &self.selection {
            if ids.is_empty() {
                return Err(ExportError::validation(
                    "ids selection must name at least one id",
                ));
            }
        }
        Ok(())
    }
}

/// A registered export definition resolved by name: the schema plus the key
/// of the row source that produces its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDefinition {
    pub name: String,
    pub row_source_key: String,
    pub schema: Schema,
    #[serde(default)]
    pub default_render_options: RenderOptions,
}

/// Progress state of a tracked export.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize,
)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExportState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Deleted,
}

impl ExportState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExportState::Queued | ExportState::Running)
    }

    /// Whether the state machine admits `self → next`. `running → running`
    /// coalesces: a retried attempt re-enters the running state without a
    /// fresh edge.
    pub fn can_transition_to(self, next: ExportState) -> bool {
        use ExportState::*;
        match (self, next) {
            (Queued, Running | Canceled | Deleted) => true,
            (Running, Running | Completed | Failed | Canceled) => true,
            (Completed | Failed | Canceled, Deleted) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counts {
    pub processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactMeta {
    /// `Content-Disposition` value for attachment downloads.
    pub fn content_disposition(&self) -> String {
        let escaped = self.filename.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{escaped}\"")
    }
}

/// Reference to a stored artifact. The store owns the bytes; the tracker
/// record holds this reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub meta: ArtifactMeta,
}

/// Durable record of one export through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub id: ExportId,
    pub definition: String,
    pub format: Format,
    pub state: ExportState,
    pub requested_by: Actor,
    pub scope: Scope,
    #[serde(default)]
    pub counts: Counts,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// Message of the failure that terminated the export, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ExportRecord {
    /// A fresh `queued` record for `actor`'s request. The scope is copied out
    /// of the actor so it survives even if actor details are redacted later.
    pub fn new(id: ExportId, request: &ExportRequest, actor: &Actor) -> Self {
        Self {
            id,
            definition: request.definition.clone(),
            format: request.format,
            state: ExportState::Queued,
            requested_by: actor.clone(),
            scope: actor.scope.clone(),
            counts: Counts {
                total: request.estimated_rows,
                ..Default::default()
            },
            bytes_written: 0,
            artifact: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: None,
        }
    }
}

/// Everything a transport needs to serve a download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadInfo {
    pub record: ExportRecord,
    pub artifact: ArtifactRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}
