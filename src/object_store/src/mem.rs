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
use bytes::Bytes;
use chrono::Utc;
use outflow_common::types::{ArtifactMeta, ArtifactRef};
use outflow_common::{ExecContext, ExportError, Result};
use parking_lot::Mutex;

use crate::{normalize_key, ArtifactStore, BoxArtifactReader};

/// In-memory artifact store. Insertion under the lock makes `put` atomic at
/// the key level by construction.
#[derive(Default)]
pub struct InMemArtifactStore {
    objects: Mutex<HashMap<String, (Bytes, ArtifactMeta)>>,
}

impl InMemArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemArtifactStore {
    async fn put(
        &self,
        ctx: &ExecContext,
        key: &str,
        data: Bytes,
        mut meta: ArtifactMeta,
    ) -> Result<ArtifactRef> {
        ctx.check()?;
        let key = normalize_key(key)?;
        meta.size = data.len() as u64;
        meta.created_at = Utc::now();
        self.objects
            .lock()
            .insert(key.clone(), (data, meta.clone()));
        Ok(ArtifactRef { key, meta })
    }

    async fn open(
        &self,
        ctx: &ExecContext,
        key: &str,
    ) -> Result<(BoxArtifactReader, ArtifactMeta)> {
        ctx.check()?;
        let key = normalize_key(key)?;
        let (data, meta) = self
            .objects
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| ExportError::not_found(format!("artifact {key:?}")))?;
        Ok((Box::new(std::io::Cursor::new(data)), meta))
    }

    async fn metadata(&self, ctx: &ExecContext, key: &str) -> Result<ArtifactMeta> {
        ctx.check()?;
        let key = normalize_key(key)?;
        self.objects
            .lock()
            .get(&key)
            .map(|(_, meta)| meta.clone())
            .ok_or_else(|| ExportError::not_found(format!("artifact {key:?}")))
    }

    async fn delete(&self, ctx: &ExecContext, key: &str) -> Result<()> {
        ctx.check()?;
        let key = normalize_key(key)?;
        self.objects.lock().remove(&key);
        Ok(())
    }

    async fn list(&self, ctx: &ExecContext, prefix: &str) -> Result<Vec<ArtifactRef>> {
        ctx.check()?;
        let mut refs: Vec<_> = self
            .objects
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (_, meta))| ArtifactRef {
                key: key.clone(),
                meta: meta.clone(),
            })
            .collect();
        refs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(refs)
    }

    fn store_media_type(&self) -> &'static str {
        "mem"
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn meta(filename: &str) -> ArtifactMeta {
        ArtifactMeta {
            filename: filename.to_owned(),
            content_type: "text/csv".to_owned(),
            size: 0,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_put_open_roundtrip() {
        let store = InMemArtifactStore::new();
        let ctx = ExecContext::new();
        let stored = store
            .put(&ctx, "exports/a.csv", Bytes::from_static(b"id\n1\n"), meta("a.csv"))
            .await
            .unwrap();
        assert_eq!(stored.meta.size, 5);

        let (mut reader, opened_meta) = store.open(&ctx, "exports/a.csv").await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"id\n1\n");
        assert_eq!(opened_meta.filename, "a.csv");
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let store = InMemArtifactStore::new();
        let err = match store.open(&ExecContext::new(), "exports/nope.csv").await {
            Ok(_) => panic!("expected open of missing artifact to fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), outflow_common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemArtifactStore::new();
        let ctx = ExecContext::new();
        store
            .put(&ctx, "exports/a.csv", Bytes::from_static(b"x"), meta("a.csv"))
            .await
            .unwrap();
        store.delete(&ctx, "exports/a.csv").await.unwrap();
        store.delete(&ctx, "exports/a.csv").await.unwrap();
        assert!(store.open(&ctx, "exports/a.csv").await.is_err());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = InMemArtifactStore::new();
        let ctx = ExecContext::new();
        for key in ["exports/a.csv", "exports/b.csv", "other/c.csv"] {
            store
                .put(&ctx, key, Bytes::from_static(b"x"), meta("f"))
                .await
                .unwrap();
        }
        let listed = store.list(&ctx, "exports/").await.unwrap();
        assert_eq!(
            listed.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["exports/a.csv", "exports/b.csv"]
        );
    }
}
