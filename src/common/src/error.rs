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

use parse_display::Display;
use serde::Serialize;
use thiserror::Error;

/// A specialized Result type for export operations.
pub type Result<T, E = ExportError> = std::result::Result<T, E>;

/// The pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum Stage {
    Open,
    Render,
    Store,
    Track,
}

/// Coarse error classification shared by every crate. Transports derive the
/// response status from it, the retry policy derives retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Auth,
    Conflict,
    Timeout,
    Canceled,
    NotImplemented,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Auth => 403,
            ErrorKind::Conflict => 409,
            ErrorKind::Timeout => 504,
            ErrorKind::Canceled => 499,
            ErrorKind::NotImplemented => 501,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether an error of this kind is retried by the default retry
    /// classifier. `Canceled` is never retryable.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Internal)
    }
}

/// The error type for export operations.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("validation error: {0}")]
    Validation(Box<str>),

    #[error("{0} not found")]
    NotFound(Box<str>),

    #[error("permission denied: {0}")]
    PermissionDenied(Box<str>),

    #[error("conflict: {0}")]
    Conflict(Box<str>),

    #[error("deadline exceeded: {0}")]
    Timeout(Box<str>),

    #[error("operation canceled")]
    Canceled,

    #[error("not implemented: {0}")]
    NotImplemented(Box<str>),

    /// A failure tagged with the pipeline stage it surfaced in. The kind of
    /// the underlying error is preserved.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<ExportError>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExportError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into().into_boxed_str())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into().into_boxed_str())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into().into_boxed_str())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into().into_boxed_str())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into().into_boxed_str())
    }

    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into().into_boxed_str())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(msg.into()))
    }

    /// Tag this error with the stage it surfaced in. Already-tagged errors
    /// keep their original stage.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            e @ ExportError::Stage { .. } => e,
            e => ExportError::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Validation(_) => ErrorKind::Validation,
            ExportError::NotFound(_) => ErrorKind::NotFound,
            ExportError::PermissionDenied(_) => ErrorKind::Auth,
            ExportError::Conflict(_) => ErrorKind::Conflict,
            ExportError::Timeout(_) => ErrorKind::Timeout,
            ExportError::Canceled => ErrorKind::Canceled,
            ExportError::NotImplemented(_) => ErrorKind::NotImplemented,
            ExportError::Stage { source, .. } => source.kind(),
            ExportError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExportError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::Internal(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        ExportError::Internal(anyhow::Error::new(e))
    }
}

/// Attach a stage tag to the error of a fallible pipeline step.
pub trait StageExt<T> {
    fn at_stage(self, stage: Stage) -> Result<T>;
}

impl<T, E: Into<ExportError>> StageExt<T> for std::result::Result<T, E> {
    fn at_stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| e.into().at(stage))
    }
}

/// Wire representation of an error: `{code, message, details?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&ExportError> for ErrorBody {
    fn from(e: &ExportError) -> Self {
        let details = e
            .stage()
            .map(|s| serde_json::json!({ "stage": s.to_string() }));
        Self {
            code: e.kind(),
            message: e.to_string(),
            details,
        }
    }
}
