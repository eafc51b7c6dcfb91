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
use outflow_common::schema::Column;
use outflow_common::{Actor, ExecContext, ExportRequest, Result, Row, Scope};

mod callback;
mod channel;
mod memory;

pub use callback::{CallbackSource, FnIterator};
pub use channel::{channel_source, ChannelSource, RowSender};
pub use memory::MemorySource;

/// Everything a source needs to produce rows for one execution attempt.
#[derive(Debug, Clone)]
pub struct RowSourceSpec {
    pub request: ExportRequest,
    /// Columns after projection; yielded rows must align with these.
    pub columns: Vec<Column>,
    pub actor: Actor,
}

impl RowSourceSpec {
    pub fn scope(&self) -> &Scope {
        &self.actor.scope
    }
}

/// A lazy stream of rows backed by some producer. Not `Sync`: one consumer
/// drives it.
///
/// Contract:
/// - `next` yields rows in producer order, `Ok(None)` at end of stream, and
///   fails fast with the context error once the opening context is done.
/// - `close` is idempotent and releases all underlying resources.
/// - callers never invoke `next` after `close`.
#[async_trait]
pub trait RowIterator: Send {
    async fn next(&mut self) -> Result<Option<Row>>;

    async fn close(&mut self) -> Result<()>;
}

pub type BoxRowIterator = Box<dyn RowIterator>;

/// An opener for row streams. `open` must not prefetch: no row is pulled from
/// the backend before the caller first calls `next`.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn open(&self, ctx: &ExecContext, spec: RowSourceSpec) -> Result<BoxRowIterator>;
}

/// Rewrites source query parameters with the requesting actor's scope before
/// the source executes. Registered per source; sources apply it in `open`.
pub trait ScopeInjector: Send + Sync {
    fn inject(&self, scope: &Scope, query: &mut serde_json::Value);
}

/// Default injector: forces `tenant_id` (and `workspace_id` when present)
/// into the query object, overwriting caller-supplied values.
#[derive(Debug, Default)]
pub struct TenantScopeInjector;

impl ScopeInjector for TenantScopeInjector {
    fn inject(&self, scope: &Scope, query: &mut serde_json::Value) {
        if !query.is_object() {
            *query = serde_json::json!({});
        }
        let obj = query.as_object_mut().unwrap();
        obj.insert(
            "tenant_id".to_owned(),
            serde_json::Value::String(scope.tenant_id.clone()),
        );
        if let Some(workspace) = &scope.workspace_id {
            obj.insert(
                "workspace_id".to_owned(),
                serde_json::Value::String(workspace.clone()),
            );
        }
    }
}

/// Apply `injector` to the spec's query in place. Sources call this before
/// executing the query.
pub fn apply_scope(spec: &mut RowSourceSpec, injector: Option<&dyn ScopeInjector>) {
    if let Some(injector) = injector {
        let scope = spec.actor.scope.clone();
        let query = spec
            .request
            .query
            .get_or_insert_with(|| serde_json::json!({}));
        injector.inject(&scope, query);
    }
}

#[cfg(test)]
pub(crate) fn tests_spec() -> RowSourceSpec {
    use outflow_common::types::Format;
    RowSourceSpec {
        request: ExportRequest::new("users", Format::Csv),
        columns: vec![],
        actor: Actor::new("tester"),
    }
}

#[cfg(test)]
mod tests {
    use outflow_common::types::Format;

    use super::*;

    #[test]
    fn test_tenant_scope_injection_overwrites() {
        let mut spec = RowSourceSpec {
            request: ExportRequest::new("users", Format::Csv),
            columns: vec![],
            actor: Actor::new("u1").with_scope(Scope {
                tenant_id: "t1".into(),
                workspace_id: Some("w1".into()),
            }),
        };
        spec.request.query = Some(serde_json::json!({"tenant_id": "spoofed", "q": "x"}));

        apply_scope(&mut spec, Some(&TenantScopeInjector));
        let query = spec.request.query.unwrap();
        assert_eq!(query["tenant_id"], "t1");
        assert_eq!(query["workspace_id"], "w1");
        assert_eq!(query["q"], "x");
    }

    #[test]
    fn test_scope_injection_creates_query() {
        let mut spec = RowSourceSpec {
            request: ExportRequest::new("users", Format::Csv),
            columns: vec![],
            actor: Actor::new("u1"),
        };
        assert!(spec.request.query.is_none());
        apply_scope(&mut spec, Some(&TenantScopeInjector));
        assert!(spec.request.query.unwrap().get("tenant_id").is_some());
    }
}
