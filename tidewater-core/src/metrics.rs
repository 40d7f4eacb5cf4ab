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

//! Metrics instrumentation for the consumer.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host installs a recorder. Names follow Prometheus conventions
//! (`tidewater_` prefix, `_total` suffix on counters).
//!
//! Labels are kept low-cardinality: operation kind and error category only.
//!
//! ```rust
//! use tidewater_core::metrics;
//!
//! metrics::init_metrics();
//! metrics::increment_events_processed("insert");
//! ```

use crate::consumer::ConnectionState;
use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Metric name prefix for all Tidewater metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "tidewater";

/// Events fully processed (dispatched and committed).
///
/// Type: Counter
/// Labels: operation
#[doc(hidden)]
pub const EVENTS_PROCESSED_TOTAL: &str = "tidewater_events_processed_total";

/// Dispatch observers that returned an error or panicked.
///
/// Type: Counter
/// Labels: operation
#[doc(hidden)]
pub const HANDLER_FAILURES_TOTAL: &str = "tidewater_handler_failures_total";

/// Failures reported by the source.
///
/// Type: Counter
/// Labels: error_type
#[doc(hidden)]
pub const STREAM_FAILURES_TOTAL: &str = "tidewater_stream_failures_total";

/// Reconnections scheduled.
///
/// Type: Counter
#[doc(hidden)]
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "tidewater_reconnect_attempts_total";

/// Current connection state (0=idle, 1=streaming, 2=faulted, 3=reconnecting, 4=terminated).
///
/// Type: Gauge
#[doc(hidden)]
pub const CONNECTION_STATE: &str = "tidewater_connection_state";

/// Registers metric descriptions. Call once at startup.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_PROCESSED_TOTAL,
        "Total number of change events dispatched and committed"
    );
    describe_counter!(
        HANDLER_FAILURES_TOTAL,
        "Total number of dispatch observer failures (errors and panics)"
    );
    describe_counter!(
        STREAM_FAILURES_TOTAL,
        "Total number of failures reported by the change stream source"
    );
    describe_counter!(
        RECONNECT_ATTEMPTS_TOTAL,
        "Total number of scheduled reconnection attempts"
    );
    describe_gauge!(
        CONNECTION_STATE,
        "Connection state: 0=idle, 1=streaming, 2=faulted, 3=reconnecting, 4=terminated"
    );
}

pub fn increment_events_processed(operation: &'static str) {
    counter!(EVENTS_PROCESSED_TOTAL, "operation" => operation).increment(1);
}

pub fn increment_handler_failures(operation: &'static str) {
    counter!(HANDLER_FAILURES_TOTAL, "operation" => operation).increment(1);
}

pub fn increment_stream_failures(error_type: &'static str) {
    counter!(STREAM_FAILURES_TOTAL, "error_type" => error_type).increment(1);
}

pub fn increment_reconnect_attempts() {
    counter!(RECONNECT_ATTEMPTS_TOTAL).increment(1);
}

pub fn set_connection_state(state: ConnectionState) {
    gauge!(CONNECTION_STATE).set(f64::from(state as u8));
}
