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

use std::sync::Arc;

use bytes::Bytes;
use outflow_common::types::{ArtifactMeta, ArtifactRef};
use outflow_common::{ExecContext, Result};
use prometheus::{
    histogram_opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry, HistogramVec,
    IntCounter, IntCounterVec, Registry,
};

use crate::{ArtifactStore, BoxArtifactReader};

/// Operation metrics shared by every artifact store backend.
pub struct ArtifactStoreMetrics {
    pub operation_latency: HistogramVec,
    pub failure_count: IntCounterVec,
    pub write_bytes: IntCounter,
}

impl ArtifactStoreMetrics {
    pub fn new(registry: &Registry) -> Self {
        let operation_latency = register_histogram_vec_with_registry!(
            histogram_opts!(
                "artifact_store_operation_latency",
                "Latency of artifact store operations",
                prometheus::exponential_buckets(0.001, 2.0, 16).unwrap()
            ),
            &["media_type", "type"],
            registry
        )
        .unwrap();

        let failure_count = register_int_counter_vec_with_registry!(
            "artifact_store_failure_count",
            "Failed artifact store operations",
            &["type"],
            registry
        )
        .unwrap();

        let write_bytes = register_int_counter_with_registry!(
            "artifact_store_write_bytes",
            "Bytes written to the artifact store",
            registry
        )
        .unwrap();

        Self {
            operation_latency,
            failure_count,
            write_bytes,
        }
    }

    /// Metrics registered nowhere, for tests.
    pub fn unused() -> Self {
        Self::new(&Registry::new())
    }
}

fn try_update_failure_metric<T>(
    metrics: &Arc<ArtifactStoreMetrics>,
    result: &Result<T>,
    operation_type: &'static str,
) {
    if result.is_err() {
        metrics
            .failure_count
            .with_label_values(&[operation_type])
            .inc();
    }
}

/// An [`ArtifactStore`] recording per-operation latency, failures and written
/// bytes.
pub struct MonitoredArtifactStore<S: ArtifactStore> {
    inner: S,
    metrics: Arc<ArtifactStoreMetrics>,
}

impl<S: ArtifactStore> MonitoredArtifactStore<S> {
    pub fn new(store: S, metrics: Arc<ArtifactStoreMetrics>) -> Self {
        Self {
            inner: store,
            metrics,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn media_type(&self) -> &'static str {
        self.inner.store_media_type()
    }

    pub async fn put(
        &self,
        ctx: &ExecContext,
        key: &str,
        data: Bytes,
        meta: ArtifactMeta,
    ) -> Result<ArtifactRef> {
        let operation_type = "put";
        self.metrics.write_bytes.inc_by(data.len() as u64);
        let _timer = self
            .metrics
            .operation_latency
            .with_label_values(&[self.media_type(), operation_type])
            .start_timer();
        let res = self.inner.put(ctx, key, data, meta).await;
        try_update_failure_metric(&self.metrics, &res, operation_type);
        res
    }

    pub async fn open(
        &self,
        ctx: &ExecContext,
        key: &str,
    ) -> Result<(BoxArtifactReader, ArtifactMeta)> {
        let operation_type = "open";
        let _timer = self
            .metrics
            .operation_latency
            .with_label_values(&[self.media_type(), operation_type])
            .start_timer();
        let res = self.inner.open(ctx, key).await;
        try_update_failure_metric(&self.metrics, &res, operation_type);
        res
    }

    pub async fn metadata(&self, ctx: &ExecContext, key: &str) -> Result<ArtifactMeta> {
        let operation_type = "metadata";
        let _timer = self
            .metrics
            .operation_latency
            .with_label_values(&[self.media_type(), operation_type])
            .start_timer();
        let res = self.inner.metadata(ctx, key).await;
        try_update_failure_metric(&self.metrics, &res, operation_type);
        res
    }

    pub async fn delete(&self, ctx: &ExecContext, key: &str) -> Result<()> {
        let operation_type = "delete";
        let _timer = self
            .metrics
            .operation_latency
            .with_label_values(&[self.media_type(), operation_type])
            .start_timer();
        let res = self.inner.delete(ctx, key).await;
        try_update_failure_metric(&self.metrics, &res, operation_type);
        res
    }

    pub async fn list(&self, ctx: &ExecContext, prefix: &str) -> Result<Vec<ArtifactRef>> {
        let operation_type = "list";
        let _timer = self
            .metrics
            .operation_latency
            .with_label_values(&[self.media_type(), operation_type])
            .start_timer();
        let res = self.inner.list(ctx, prefix).await;
        try_update_failure_metric(&self.metrics, &res, operation_type);
        res
    }
}
