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
use std::sync::Arc;

use outflow_common::types::ExportId;
use outflow_common::{ExecContext, ExportError, Result};
use parking_lot::Mutex;

/// Live cancellation handles of in-flight executions, keyed by export id.
///
/// An execution registers its context before it starts streaming and holds
/// the returned registration for its lifetime; dropping it removes the entry.
/// A second registration under the same id is a conflict, which doubles as
/// the at-most-one-execution guard.
#[derive(Default, Debug)]
pub struct CancelRegistry {
    entries: Mutex<HashMap<ExportId, ExecContext>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        self: Arc<Self>,
        id: ExportId,
        handle: ExecContext,
    ) -> Result<CancelRegistration> {
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&id) {
                return Err(ExportError::conflict(format!(
                    "export {id} already has a running execution"
                )));
            }
            entries.insert(id.clone(), handle);
        }
        Ok(CancelRegistration { registry: self, id })
    }

    /// Cancel the execution registered under `id`.
    pub fn cancel(&self, id: &ExportId) -> Result<()> {
        match self.entries.lock().get(id) {
            Some(handle) => {
                handle.cancel();
                Ok(())
            }
            None => Err(ExportError::not_found(format!(
                "cancel handle for export {id}"
            ))),
        }
    }

    pub fn is_registered(&self, id: &ExportId) -> bool {
        self.entries.lock().contains_key(id)
    }
}

/// Removes its registry entry on drop, so an execution cannot leak its
/// cancel handle on any exit path.
#[derive(Debug)]
pub struct CancelRegistration {
    registry: Arc<CancelRegistry>,
    id: ExportId,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.registry.entries.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancel_release() {
        let registry = Arc::new(CancelRegistry::new());
        let ctx = ExecContext::new();
        let id = ExportId::new();

        let registration = registry.clone().register(id.clone(), ctx.clone()).unwrap();
        assert!(registry.is_registered(&id));

        registry.cancel(&id).unwrap();
        assert!(ctx.is_canceled());

        drop(registration);
        assert!(!registry.is_registered(&id));
        assert_eq!(
            registry.cancel(&id).unwrap_err().kind(),
            outflow_common::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_double_registration_conflicts() {
        let registry = Arc::new(CancelRegistry::new());
        let id = ExportId::new();
        let _first = registry
            .clone()
            .register(id.clone(), ExecContext::new())
            .unwrap();
        let err = registry
            .clone()
            .register(id.clone(), ExecContext::new())
            .unwrap_err();
        assert_eq!(err.kind(), outflow_common::ErrorKind::Conflict);
    }

    #[test]
    fn test_release_then_reregister() {
        let registry = Arc::new(CancelRegistry::new());
        let id = ExportId::new();
        drop(
            registry
                .clone()
                .register(id.clone(), ExecContext::new())
                .unwrap(),
        );
        registry.register(id, ExecContext::new()).unwrap();
    }
}
