// Copyright 2025 Tidewater Contributors
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
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded reconnection policy.
//!
//! [`ReconnectionController`] counts consecutive source failures and decides
//! whether the consumer should reopen the stream or give up.
//!
//! # Algorithm
//!
//! On each failure:
//! 1. `attempts += 1`
//! 2. If the [`RetryPolicy`] rejects the failure, give up
//! 3. If `attempts > max_attempts`, give up
//! 4. Otherwise retry after the fixed `interval`
//!
//! The first successfully processed event resets `attempts` to 0. With
//! `max_attempts = 3`, failures 1 to 3 are retried and the fourth
//! consecutive failure is fatal.
//!
//! ```rust
//! use tidewater_core::reconnect::{ReconnectDecision, ReconnectionController, RetryPolicy};
//! use tidewater_core::error::{Failure, StreamError};
//! use std::time::Duration;
//!
//! let mut controller =
//!     ReconnectionController::new(1, Duration::from_secs(5), RetryPolicy::Uniform);
//!
//! let decision = controller.on_failure(&Failure::from(StreamError::Ended));
//! assert_eq!(decision, ReconnectDecision::Retry { attempt: 1, delay: Duration::from_secs(5) });
//!
//! let decision = controller.on_failure(&Failure::from(StreamError::Ended));
//! assert_eq!(decision, ReconnectDecision::GiveUp { attempts: 2, retriable: true });
//! ```

use crate::error::Failure;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How failures are classified before the attempt budget is consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Every failure is retried the same way.
    #[default]
    Uniform,

    /// Only transient failures (network, failover, cursor loss) are retried;
    /// anything else is fatal on first sight.
    TransientOnly,
}

impl RetryPolicy {
    /// Returns true if `failure` may be retried under this policy.
    #[must_use]
    pub fn permits(&self, failure: &Failure) -> bool {
        match self {
            Self::Uniform => true,
            Self::TransientOnly => failure.is_transient(),
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::TransientOnly => "transient",
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "transient" | "transient_only" | "transient-only" => Ok(Self::TransientOnly),
            other => Err(format!(
                "unknown retry policy '{other}' (expected 'uniform' or 'transient')"
            )),
        }
    }
}

/// Outcome of [`ReconnectionController::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reopen after `delay`. `attempt` is the new failure count.
    Retry { attempt: u32, delay: Duration },

    /// Stop. `retriable` is false when the policy rejected the failure
    /// rather than the budget running out.
    GiveUp { attempts: u32, retriable: bool },
}

/// Consecutive-failure counter with a fixed retry interval.
#[derive(Debug, Clone)]
pub struct ReconnectionController {
    attempts: u32,
    max_attempts: u32,
    interval: Duration,
    policy: RetryPolicy,
}

impl ReconnectionController {
    #[must_use]
    pub fn new(max_attempts: u32, interval: Duration, policy: RetryPolicy) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            interval,
            policy,
        }
    }

    /// Records a failure and decides what to do next.
    pub fn on_failure(&mut self, failure: &Failure) -> ReconnectDecision {
        self.attempts = self.attempts.saturating_add(1);
        warn!(
            attempts = self.attempts,
            max_attempts = self.max_attempts,
            category = failure.category(),
            error = %failure,
            "Change stream failure"
        );

        if !self.policy.permits(failure) {
            error!(
                policy = %self.policy,
                category = failure.category(),
                "Failure is not retriable under the configured policy"
            );
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
                retriable: false,
            };
        }

        if self.is_max_attempts_exceeded(self.max_attempts) {
            error!(
                attempts = self.attempts,
                max_attempts = self.max_attempts,
                "Exceeded maximum reconnection attempts"
            );
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
                retriable: true,
            };
        }

        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.interval,
        }
    }

    /// Records a successfully processed event.
    pub fn on_success(&mut self) {
        if self.attempts > 0 {
            debug!(previous_attempts = self.attempts, "Stream healthy again");
        }
        self.reset_reconnect_attempts();
    }

    /// Sets the failure count back to zero. Idempotent.
    pub fn reset_reconnect_attempts(&mut self) {
        self.attempts = 0;
    }

    /// True iff `attempts > max` (strictly greater).
    #[must_use]
    pub fn is_max_attempts_exceeded(&self, max: u32) -> bool {
        self.attempts > max
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}
