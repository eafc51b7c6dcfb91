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

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use outflow_common::types::{ArtifactMeta, ArtifactRef};
use outflow_common::{ExecContext, ExportError, Result};
use tokio::io::AsyncWriteExt;

use crate::{normalize_key, ArtifactStore, BoxArtifactReader};

const META_SUFFIX: &str = ".meta.json";
const TMP_PREFIX: &str = ".tmp-";

/// Filesystem-backed artifact store rooted at one directory.
///
/// Writes go to a temp file in the root, are fsynced, then renamed onto the
/// final key, so a crash mid-put never leaves a partial artifact under the
/// key. Metadata lives in a JSON sidecar next to the artifact.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{META_SUFFIX}"))
    }

    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        let tmp = self
            .root
            .join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_meta(&self, key: &str) -> Result<ArtifactMeta> {
        match tokio::fs::read(self.meta_path(key)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(ExportError::not_found(format!("artifact {key:?}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                // Async recursion needs the nested future boxed.
                Box::pin(self.collect_keys(&path, out)).await?;
            } else if !name.ends_with(META_SUFFIX) && !name.starts_with(TMP_PREFIX) {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
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

        let target = self.data_path(&key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.write_atomic(&target, &data).await?;
        self.write_atomic(&self.meta_path(&key), &serde_json::to_vec(&meta)?)
            .await?;
        Ok(ArtifactRef { key, meta })
    }

    async fn open(
        &self,
        ctx: &ExecContext,
        key: &str,
    ) -> Result<(BoxArtifactReader, ArtifactMeta)> {
        ctx.check()?;
        let key = normalize_key(key)?;
        let meta = self.read_meta(&key).await?;
        let file = match tokio::fs::File::open(self.data_path(&key)).await {
            Ok(f) => f,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(ExportError::not_found(format!("artifact {key:?}")));
            }
            Err(e) => return Err(e.into()),
        };
        Ok((Box::new(file), meta))
    }

    async fn metadata(&self, ctx: &ExecContext, key: &str) -> Result<ArtifactMeta> {
        ctx.check()?;
        let key = normalize_key(key)?;
        self.read_meta(&key).await
    }

    async fn delete(&self, ctx: &ExecContext, key: &str) -> Result<()> {
        ctx.check()?;
        let key = normalize_key(key)?;
        for path in [self.data_path(&key), self.meta_path(&key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list(&self, ctx: &ExecContext, prefix: &str) -> Result<Vec<ArtifactRef>> {
        ctx.check()?;
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys).await?;
        keys.sort();
        let mut refs = Vec::new();
        for key in keys {
            if !key.starts_with(prefix) {
                continue;
            }
            match self.read_meta(&key).await {
                Ok(meta) => refs.push(ArtifactRef { key, meta }),
                // An artifact without its sidecar is mid-delete; skip it.
                Err(e) if e.kind() == outflow_common::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(refs)
    }

    fn store_media_type(&self) -> &'static str {
        "fs"
    }
}
