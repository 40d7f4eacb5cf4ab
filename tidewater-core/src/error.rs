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

//! Error taxonomy for stream consumption.
//!
//! | Error | Raised when | Handling |
//! |-------|-------------|----------|
//! | [`ConnectionError`] | opening a subscription fails | fed to the reconnection policy |
//! | [`StreamError`] | an active subscription fails | fed to the reconnection policy |
//! | [`CloseError`] | releasing a subscription fails | logged and swallowed |
//! | [`FatalError`] | retries are exhausted or the failure is not retriable | returned to the host |
//!
//! Only [`FatalError`] leaves the consumer.

use crate::event::ConversionError;
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind};
use thiserror::Error;

/// Boxed error returned by dispatch observers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Driver-level detail of a source failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SourceFailure {
    pub message: String,

    /// Server error code, when the failure came from a command
    pub code: Option<i32>,

    /// Server error labels (e.g. "NetworkError")
    pub labels: Vec<String>,

    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SourceFailure {
    /// Creates a failure carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            labels: Vec::new(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Extracts code and labels from a driver error.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };
        let mut labels: Vec<String> = err.labels().iter().cloned().collect();
        labels.sort();

        Self {
            message: err.to_string(),
            code,
            labels,
            source: Some(Box::new(err)),
        }
    }

    /// Returns true if the failure is expected to clear up on its own.
    ///
    /// Labels are checked first; otherwise only a known set of network,
    /// failover and cursor codes qualifies. Anything without a code is
    /// treated as permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        if self.labels.iter().any(|l| {
            l == "RetryableWriteError" || l == "TransientTransactionError" || l == "NetworkError"
        }) {
            return true;
        }

        matches!(
            self.code,
            Some(
                6 |     // HostUnreachable
                7 |     // HostNotFound
                43 |    // CursorNotFound
                89 |    // NetworkTimeout
                91 |    // ShutdownInProgress
                10107 | // NotWritablePrimary
                11600 | // InterruptedAtShutdown
                11602 | // InterruptedDueToReplStateChange
                13435 | // NotPrimaryNoSecondaryOk
                13436   // NotPrimaryOrSecondary
            )
        )
    }
}

impl From<MongoError> for SourceFailure {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

/// Failure to open a subscription.
#[derive(Debug, Error)]
#[error("Failed to open change stream: {0}")]
pub struct ConnectionError(#[source] pub SourceFailure);

impl From<SourceFailure> for ConnectionError {
    fn from(failure: SourceFailure) -> Self {
        Self(failure)
    }
}

/// Failure reported by an active subscription.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The server or transport reported an error mid-stream
    #[error("Change stream error: {0}")]
    Source(#[source] SourceFailure),

    /// An event could not be decoded
    #[error("Event conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// The sequence finished without error, which a live stream never does
    #[error("Change stream ended unexpectedly")]
    Ended,
}

impl From<SourceFailure> for StreamError {
    fn from(failure: SourceFailure) -> Self {
        Self::Source(failure)
    }
}

/// Failure while releasing a subscription.
#[derive(Debug, Error)]
#[error("Failed to close change stream: {0}")]
pub struct CloseError(#[source] pub SourceFailure);

/// Any failure that drives the reconnection policy.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl Failure {
    /// Returns true if the failure is expected to clear up on reconnection.
    ///
    /// Conversion failures are permanent: the same event would be replayed.
    /// An unexpected end of stream is treated as transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(ConnectionError(f)) | Self::Stream(StreamError::Source(f)) => {
                f.is_transient()
            }
            Self::Stream(StreamError::Conversion(_)) => false,
            Self::Stream(StreamError::Ended) => true,
        }
    }

    /// Returns a low-cardinality label for metrics and logs.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Stream(StreamError::Source(_)) => "stream",
            Self::Stream(StreamError::Conversion(_)) => "conversion",
            Self::Stream(StreamError::Ended) => "ended",
        }
    }
}

/// Unrecoverable condition surfaced to the host.
#[derive(Debug, Error)]
pub enum FatalError {
    /// More consecutive failures than the configured budget
    #[error("Exceeded maximum reconnection attempts ({max_attempts}) after {attempts} failures")]
    MaxAttemptsExceeded {
        attempts: u32,
        max_attempts: u32,
        #[source]
        last_failure: Failure,
    },

    /// The retry policy rejected the failure outright
    #[error("Non-retriable change stream failure: {0}")]
    NonRetriable(#[source] Failure),
}
