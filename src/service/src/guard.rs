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
use outflow_common::types::{Actor, ExportRecord, ExportRequest, ResolvedDefinition};
use outflow_common::{ExportError, Result};

/// Authorization seam consulted by the pipeline. Export authorization runs
/// after the definition is resolved and strictly before the row source is
/// opened; download authorization runs before any artifact byte is read.
/// Denials surface as `auth` errors.
#[async_trait]
pub trait ExportGuard: Send + Sync {
    async fn authorize_export(
        &self,
        actor: &Actor,
        request: &ExportRequest,
        resolved: &ResolvedDefinition,
    ) -> Result<()>;

    async fn authorize_download(&self, actor: &Actor, record: &ExportRecord) -> Result<()>;
}

/// Permits everything. The default when no guard is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllGuard;

#[async_trait]
impl ExportGuard for AllowAllGuard {
    async fn authorize_export(
        &self,
        _actor: &Actor,
        _request: &ExportRequest,
        _resolved: &ResolvedDefinition,
    ) -> Result<()> {
        Ok(())
    }

    async fn authorize_download(&self, _actor: &Actor, _record: &ExportRecord) -> Result<()> {
        Ok(())
    }
}

/// Requires one role for exporting and downloading alike.
#[derive(Debug, Clone)]
pub struct RoleGuard {
    role: String,
}

impl RoleGuard {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }

    fn check(&self, actor: &Actor) -> Result<()> {
        if actor.has_role(&self.role) {
            Ok(())
        } else {
            Err(ExportError::permission_denied(format!(
                "actor {:?} lacks role {:?}",
                actor.id, self.role
            )))
        }
    }
}

#[async_trait]
impl ExportGuard for RoleGuard {
    async fn authorize_export(
        &self,
        actor: &Actor,
        _request: &ExportRequest,
        _resolved: &ResolvedDefinition,
    ) -> Result<()> {
        self.check(actor)
    }

    async fn authorize_download(&self, actor: &Actor, _record: &ExportRecord) -> Result<()> {
        self.check(actor)
    }
}
