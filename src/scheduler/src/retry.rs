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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use outflow_common::{ErrorKind, ExportError};
use parse_display::{Display, FromStr};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromStr, Serialize, Deserialize,
)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    None,
    Fixed,
    #[default]
    Exponential,
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub interval: Duration,
    pub max_interval: Duration,
    /// ±50 % randomization of the computed delay.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Backoff {
    pub const fn none() -> Self {
        Self {
            strategy: BackoffStrategy::None,
            interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            jitter: false,
        }
    }

    pub const fn fixed(interval: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            interval,
            max_interval: interval,
            jitter: false,
        }
    }

    /// Delay before retry `attempt` (1-based). Exponential doubles per
    /// attempt, clamped to `max_interval`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::None => return Duration::ZERO,
            BackoffStrategy::Fixed => self.interval,
            BackoffStrategy::Exponential => self
                .interval
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        };
        let capped = base.min(self.max_interval);
        if self.jitter && !capped.is_zero() {
            capped.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            capped
        }
    }
}

type Classifier = Arc<dyn Fn(&ExportError) -> bool + Send + Sync>;

/// Retry behavior of the generate task.
///
/// The retryability predicate is explicit: the default retries `timeout` and
/// `internal` errors only, and a custom classifier can widen or narrow that.
/// A canceled execution is never retried, whatever the classifier says.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    classifier: Option<Classifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::default(),
            classifier: None,
        }
    }

    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::none(),
            classifier: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&ExportError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn should_retry(&self, error: &ExportError) -> bool {
        if error.kind() == ErrorKind::Canceled {
            return false;
        }
        match &self.classifier {
            Some(classifier) => classifier(error),
            None => error.kind().is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_and_clamps() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Exponential,
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(10), Duration::from_millis(350));
        // A pathological attempt count must not overflow.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(350));
    }

    #[test]
    fn test_fixed_and_none() {
        assert_eq!(
            Backoff::fixed(Duration::from_secs(2)).delay(7),
            Duration::from_secs(2)
        );
        assert_eq!(Backoff::none().delay(1), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_half_band() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Fixed,
            interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(1000),
            jitter: true,
        };
        for _ in 0..100 {
            let delay = backoff.delay(1);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay < Duration::from_millis(1500), "{delay:?}");
        }
    }

    #[test]
    fn test_default_classifier() {
        let policy = RetryPolicy::new(2);
        assert!(policy.should_retry(&ExportError::timeout("slow")));
        assert!(policy.should_retry(&ExportError::internal("boom")));
        assert!(!policy.should_retry(&ExportError::validation("bad")));
        assert!(!policy.should_retry(&ExportError::Canceled));
    }

    #[test]
    fn test_custom_classifier_cannot_retry_canceled() {
        let policy = RetryPolicy::new(2).with_classifier(|_| true);
        assert!(policy.should_retry(&ExportError::validation("bad")));
        assert!(!policy.should_retry(&ExportError::Canceled));
    }
}
