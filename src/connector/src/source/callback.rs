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

use async_trait::async_trait;
use outflow_common::{ExecContext, Result, Row};

use super::{BoxRowIterator, RowIterator, RowSource, RowSourceSpec};

type OpenFn =
    dyn Fn(&ExecContext, &RowSourceSpec) -> Result<BoxRowIterator> + Send + Sync;

/// Adapts a closure into a [`RowSource`]. The closure runs on `open` and
/// builds the iterator; it must not pull rows itself.
#[derive(Clone)]
pub struct CallbackSource {
    open: Arc<OpenFn>,
}

impl CallbackSource {
    pub fn new(
        open: impl Fn(&ExecContext, &RowSourceSpec) -> Result<BoxRowIterator> + Send + Sync + 'static,
    ) -> Self {
        Self {
            open: Arc::new(open),
        }
    }

    /// A source whose iterator pulls rows from `f` until it yields
    /// `Ok(None)`.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut() -> Result<Option<Row>> + Send + Sync + Clone + 'static,
    {
        Self::new(move |ctx, _spec| {
            Ok(Box::new(FnIterator::new(ctx.clone(), f.clone())) as BoxRowIterator)
        })
    }
}

#[async_trait]
impl RowSource for CallbackSource {
    async fn open(&self, ctx: &ExecContext, spec: RowSourceSpec) -> Result<BoxRowIterator> {
        ctx.check()?;
        (self.open)(ctx, &spec)
    }
}

/// Iterator pulling rows from a closure.
pub struct FnIterator<F> {
    ctx: ExecContext,
    pull: F,
    closed: bool,
    finished: bool,
}

impl<F> FnIterator<F>
where
    F: FnMut() -> Result<Option<Row>> + Send,
{
    pub fn new(ctx: ExecContext, pull: F) -> Self {
        Self {
            ctx,
            pull,
            closed: false,
            finished: false,
        }
    }
}

#[async_trait]
impl<F> RowIterator for FnIterator<F>
where
    F: FnMut() -> Result<Option<Row>> + Send,
{
    async fn next(&mut self) -> Result<Option<Row>> {
        assert!(!self.closed, "next called after close");
        self.ctx.check()?;
        if self.finished {
            return Ok(None);
        }
        match (self.pull)() {
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            other => other,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
