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
use outflow_common::{ExecContext, Result, Row};

use super::{BoxRowIterator, RowIterator, RowSource, RowSourceSpec};

/// A source over a fixed set of in-memory rows. Useful in tests and as the
/// reference implementation of the iterator contract.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Vec<Row>,
}

impl MemorySource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn open(&self, ctx: &ExecContext, _spec: RowSourceSpec) -> Result<BoxRowIterator> {
        ctx.check()?;
        Ok(Box::new(MemoryIterator {
            rows: self.rows.clone().into_iter(),
            ctx: ctx.clone(),
            closed: false,
        }))
    }
}

struct MemoryIterator {
    rows: std::vec::IntoIter<Row>,
    ctx: ExecContext,
    closed: bool,
}

#[async_trait]
impl RowIterator for MemoryIterator {
    async fn next(&mut self) -> Result<Option<Row>> {
        assert!(!self.closed, "next called after close");
        self.ctx.check()?;
        Ok(self.rows.next())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use outflow_common::row;

    use super::*;

    #[tokio::test]
    async fn test_yields_rows_in_order() {
        let source = MemorySource::new(vec![row![1i64, "a"], row![2i64, "b"]]);
        let ctx = ExecContext::new();
        let mut iter = source
            .open(&ctx, super::super::tests_spec())
            .await
            .unwrap();
        assert_eq!(iter.next().await.unwrap(), Some(row![1i64, "a"]));
        assert_eq!(iter.next().await.unwrap(), Some(row![2i64, "b"]));
        assert_eq!(iter.next().await.unwrap(), None);
        iter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_next_fails_after_cancel() {
        let source = MemorySource::new(vec![row![1i64]]);
        let ctx = ExecContext::new();
        let mut iter = source
            .open(&ctx, super::super::tests_spec())
            .await
            .unwrap();
        ctx.cancel();
        assert!(iter.next().await.unwrap_err().is_canceled());
        iter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let source = MemorySource::new(vec![]);
        let ctx = ExecContext::new();
        let mut iter = source
            .open(&ctx, super::super::tests_spec())
            .await
            .unwrap();
        iter.close().await.unwrap();
        iter.close().await.unwrap();
    }
}
