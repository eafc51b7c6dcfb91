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
use outflow_common::{ExecContext, ExportError, Result, Row};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BoxRowIterator, RowIterator, RowSource, RowSourceSpec};

/// Sender half feeding a [`ChannelSource`]. Dropping it ends the stream.
pub type RowSender = mpsc::Sender<Result<Row>>;

/// A source fed by an external producer through a bounded channel. The
/// iterator blocks on the producer and wakes with the context error when the
/// execution is canceled, which makes this the adapter of choice for
/// cancellation tests and push-style backends.
///
/// The receiver is claimed by the first `open`; a second `open` fails with a
/// conflict.
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::Receiver<Result<Row>>>>,
}

/// Create a bounded channel source with room for `capacity` in-flight rows.
pub fn channel_source(capacity: usize) -> (ChannelSource, RowSender) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelSource {
            rx: Mutex::new(Some(rx)),
        },
        tx,
    )
}

#[async_trait]
impl RowSource for ChannelSource {
    async fn open(&self, ctx: &ExecContext, _spec: RowSourceSpec) -> Result<BoxRowIterator> {
        ctx.check()?;
        let rx = self.rx.lock().take().ok_or_else(|| {
            ExportError::conflict("channel source is already consumed by another execution")
        })?;
        Ok(Box::new(ChannelIterator {
            rx,
            ctx: ctx.clone(),
            closed: false,
        }))
    }
}

struct ChannelIterator {
    rx: mpsc::Receiver<Result<Row>>,
    ctx: ExecContext,
    closed: bool,
}

#[async_trait]
impl RowIterator for ChannelIterator {
    async fn next(&mut self) -> Result<Option<Row>> {
        assert!(!self.closed, "next called after close");
        tokio::select! {
            biased;
            e = self.ctx.done() => Err(e),
            item = self.rx.recv() => item.transpose(),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.rx.close();
        }
        Ok(())
    }
}
