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

use itertools::Itertools;
use outflow_common::types::{Format, ResolvedDefinition};
use outflow_common::{ExportError, Result};
use outflow_connector::render::Renderer;
use outflow_connector::source::RowSource;
use parking_lot::RwLock;

/// A name-keyed registry populated at startup and read concurrently at
/// runtime. Registration rejects empty and duplicate names.
pub struct Registry<V> {
    what: &'static str,
    entries: RwLock<HashMap<String, V>>,
}

impl<V: Clone> Registry<V> {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: impl Into<String>, value: V) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(ExportError::validation(format!(
                "{} name must not be empty",
                self.what
            )));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(ExportError::validation(format!(
                "{} {name:?} is already registered",
                self.what
            )));
        }
        entries.insert(name, value);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<V> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ExportError::not_found(format!("{} {name:?}", self.what)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().sorted().collect()
    }
}

/// Export definitions by name.
pub type DefinitionRegistry = Registry<ResolvedDefinition>;

/// Row sources by the `row_source_key` definitions declare.
pub type SourceRegistry = Registry<Arc<dyn RowSource>>;

/// Renderers keyed by target [`Format`]. A format without a registered
/// renderer resolves to `not_implemented`, unlike the plain registries.
pub struct RendererRegistry {
    inner: Registry<Arc<dyn Renderer>>,
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self {
            inner: Registry::new("renderer"),
        }
    }

    /// A registry with the bundled csv/json/html renderers in place.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .register(Arc::new(outflow_connector::render::CsvRenderer))
            .unwrap();
        registry
            .register(Arc::new(outflow_connector::render::JsonRenderer))
            .unwrap();
        registry
            .register(Arc::new(outflow_connector::render::HtmlRenderer))
            .unwrap();
        registry
    }

    pub fn register(&self, renderer: Arc<dyn Renderer>) -> Result<()> {
        self.inner.register(renderer.format().to_string(), renderer)
    }

    pub fn resolve(&self, format: Format) -> Result<Arc<dyn Renderer>> {
        self.inner.resolve(&format.to_string()).map_err(|_| {
            ExportError::not_implemented(format!("renderer for format {format}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let registry: Registry<u32> = Registry::new("thing");
        registry.register("a", 1).unwrap();
        assert_eq!(registry.resolve("a").unwrap(), 1);
        assert_eq!(
            registry.resolve("b").unwrap_err().kind(),
            outflow_common::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let registry: Registry<u32> = Registry::new("thing");
        registry.register("a", 1).unwrap();
        assert_eq!(
            registry.register("a", 2).unwrap_err().kind(),
            outflow_common::ErrorKind::Validation
        );
        assert_eq!(
            registry.register("", 3).unwrap_err().kind(),
            outflow_common::ErrorKind::Validation
        );
        // The original registration survives the failed attempts.
        assert_eq!(registry.resolve("a").unwrap(), 1);
    }

    #[test]
    fn test_missing_renderer_is_not_implemented() {
        let registry = RendererRegistry::with_defaults();
        assert!(registry.resolve(Format::Csv).is_ok());
        let err = match registry.resolve(Format::Pdf) {
            Ok(_) => panic!("expected resolve(Pdf) to fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), outflow_common::ErrorKind::NotImplemented);
    }

    #[test]
    fn test_names_sorted() {
        let registry: Registry<u32> = Registry::new("thing");
        registry.register("b", 2).unwrap();
        registry.register("a", 1).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
