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

//! Artifact storage: rendered export output keyed by a normalized,
//! store-rooted path, plus the metadata needed to serve a download.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use outflow_common::types::{ArtifactMeta, ArtifactRef};
use outflow_common::{ExecContext, ExportError, Result};
use tokio::io::AsyncRead;

pub mod fs;
pub use fs::*;

pub mod mem;
pub use mem::*;

pub mod metrics;
pub use metrics::*;

pub type ArtifactStoreRef = Arc<ArtifactStoreImpl>;

pub type BoxArtifactReader = Box<dyn AsyncRead + Unpin + Send + Sync>;

/// Normalize `key` and reject anything that could resolve outside the store
/// root: absolute paths, empty segments, `.`/`..`, or backslashes.
pub fn normalize_key(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(ExportError::validation("artifact key must not be empty"));
    }
    if key.contains('\\') {
        return Err(ExportError::validation(format!(
            "artifact key {key:?} must use forward slashes"
        )));
    }
    let mut segments = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." | ".." => {
                return Err(ExportError::validation(format!(
                    "artifact key {key:?} escapes the store root"
                )));
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Produces a time-limited public URL for an artifact key. Typically backed
/// by the blob store's presign capability.
pub trait UrlSigner: Send + Sync {
    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// The implementation must be thread-safe.
///
/// `put` is atomic at the key level: a partially written artifact is never
/// observable under the final key. `delete` is idempotent; a missing key is
/// not an error. The `size` and `created_at` of the stored metadata are
/// derived from the written bytes, whatever the caller passed in.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        ctx: &ExecContext,
        key: &str,
        data: Bytes,
        meta: ArtifactMeta,
    ) -> Result<ArtifactRef>;

    async fn open(&self, ctx: &ExecContext, key: &str)
        -> Result<(BoxArtifactReader, ArtifactMeta)>;

    async fn metadata(&self, ctx: &ExecContext, key: &str) -> Result<ArtifactMeta>;

    async fn delete(&self, ctx: &ExecContext, key: &str) -> Result<()>;

    async fn list(&self, ctx: &ExecContext, prefix: &str) -> Result<Vec<ArtifactRef>>;

    fn monitored(self, metrics: Arc<ArtifactStoreMetrics>) -> MonitoredArtifactStore<Self>
    where
        Self: Sized,
    {
        MonitoredArtifactStore::new(self, metrics)
    }

    fn store_media_type(&self) -> &'static str;
}

pub enum ArtifactStoreImpl {
    InMem(MonitoredArtifactStore<InMemArtifactStore>),
    Fs(MonitoredArtifactStore<FsArtifactStore>),
}

/// Routes an artifact store operation to the backend selected by the
/// `ArtifactStoreImpl` enum type.
macro_rules! artifact_store_impl_method_body {
    ($object_store:expr, $method_name:ident $(, $args:expr)*) => {
        {
            match $object_store {
                ArtifactStoreImpl::InMem(in_mem) => in_mem.$method_name($($args, )*).await,
                ArtifactStoreImpl::Fs(fs) => fs.$method_name($($args, )*).await,
            }
        }
    };
}

impl ArtifactStoreImpl {
    /// In-memory store for tests and single-process deployments.
    pub fn in_memory(metrics: Arc<ArtifactStoreMetrics>) -> Self {
        ArtifactStoreImpl::InMem(InMemArtifactStore::new().monitored(metrics))
    }

    pub async fn filesystem(
        root: impl Into<std::path::PathBuf>,
        metrics: Arc<ArtifactStoreMetrics>,
    ) -> Result<Self> {
        Ok(ArtifactStoreImpl::Fs(
            FsArtifactStore::new(root).await?.monitored(metrics),
        ))
    }

    pub async fn put(
        &self,
        ctx: &ExecContext,
        key: &str,
        data: Bytes,
        meta: ArtifactMeta,
    ) -> Result<ArtifactRef> {
        artifact_store_impl_method_body!(self, put, ctx, key, data, meta)
    }

    pub async fn open(
        &self,
        ctx: &ExecContext,
        key: &str,
    ) -> Result<(BoxArtifactReader, ArtifactMeta)> {
        artifact_store_impl_method_body!(self, open, ctx, key)
    }

    pub async fn metadata(&self, ctx: &ExecContext, key: &str) -> Result<ArtifactMeta> {
        artifact_store_impl_method_body!(self, metadata, ctx, key)
    }

    pub async fn delete(&self, ctx: &ExecContext, key: &str) -> Result<()> {
        artifact_store_impl_method_body!(self, delete, ctx, key)
    }

    pub async fn list(&self, ctx: &ExecContext, prefix: &str) -> Result<Vec<ArtifactRef>> {
        artifact_store_impl_method_body!(self, list, ctx, prefix)
    }

    pub fn store_media_type(&self) -> &'static str {
        match self {
            ArtifactStoreImpl::InMem(store) => store.inner().store_media_type(),
            ArtifactStoreImpl::Fs(store) => store.inner().store_media_type(),
        }
    }
}

/// An [`ArtifactStoreImpl`] paired with an optional URL signer.
pub struct SignedArtifactStore {
    store: ArtifactStoreImpl,
    signer: Option<Arc<dyn UrlSigner>>,
}

impl SignedArtifactStore {
    pub fn new(store: ArtifactStoreImpl) -> Self {
        Self {
            store,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn UrlSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn store(&self) -> &ArtifactStoreImpl {
        &self.store
    }

    /// A presigned download URL for `key`, or `not_implemented` when no
    /// signer is configured. The key must exist.
    pub async fn signed_url(
        &self,
        ctx: &ExecContext,
        key: &str,
        ttl: Duration,
    ) -> Result<String> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| ExportError::not_implemented("artifact url signing"))?;
        let key = normalize_key(key)?;
        self.store.metadata(ctx, &key).await?;
        signer.signed_url(&key, ttl)
    }
}
