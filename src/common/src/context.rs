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

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ExportError, Result};

/// Cooperative cancellation scope handed down the export pipeline.
///
/// Carries a cancel signal and an optional deadline. Every suspension point
/// (row iteration, renderer writes, store I/O, backoff sleeps) consults it and
/// returns promptly once the context is done. Cloning shares the underlying
/// signal; [`ExecContext::child`] creates a scope that is canceled with its
/// parent but can be canceled independently.
#[derive(Debug, Clone)]
pub struct ExecContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecContext {
    /// A root context without a deadline.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A root context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A scope canceled together with `self`, cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<ExportError> {
        if self.cancel.is_cancelled() {
            Some(ExportError::Canceled)
        } else if self.deadline_exceeded() {
            Some(ExportError::timeout("context deadline exceeded"))
        } else {
            None
        }
    }

    /// Fail fast when the context is done.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves once the context is done and yields the corresponding error.
    pub async fn done(&self) -> ExportError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => ExportError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => {
                        ExportError::timeout("context deadline exceeded")
                    }
                }
            }
            None => {
                self.cancel.cancelled().await;
                ExportError::Canceled
            }
        }
    }

    /// Sleep for `duration`, waking early with the context error when the
    /// context is done first. Used by retry backoff.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if let Some(e) = self.err() {
            return Err(e);
        }
        tokio::select! {
            e = self.done() => Err(e),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if let Some(e) = self.err() {
            return Err(e);
        }
        tokio::select! {
            e = self.done() => Err(e),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let root = ExecContext::new();
        let child = root.child();
        assert!(root.check().is_ok());

        root.cancel();
        assert!(child.is_canceled());
        assert_matches!(child.err(), Some(ExportError::Canceled));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alive() {
        let root = ExecContext::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_canceled());
        assert!(!root.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_timeout() {
        let ctx = ExecContext::with_timeout(Duration::from_millis(10));
        assert!(ctx.check().is_ok());
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(ctx.err().unwrap().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_cancel() {
        let ctx = ExecContext::new();
        let sleeper = ctx.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        ctx.cancel();
        let res = handle.await.unwrap();
        assert_matches!(res, Err(ExportError::Canceled));
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let ctx = ExecContext::new();
        let out = ctx.run(async { 41 + 1 }).await.unwrap();
        assert_eq!(out, 42);
    }
}
