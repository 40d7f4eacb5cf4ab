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

//! Tidewater Core - change stream consumption with bounded reconnection
//!
//! This crate consumes a `MongoDB` change stream, tracks the resume position
//! of the last processed event, and reopens the stream after failures up to
//! a fixed number of attempts.
//!
//! # Key Components
//!
//! - **Events**: [`event`] decodes change stream documents into a tagged [`event::ChangeEvent`]
//! - **Dispatch**: [`dispatch`] routes events to a [`dispatch::ChangeHandler`]
//! - **Resume state**: [`state`] holds the last committed resume token
//! - **Reconnection**: [`reconnect`] decides between retrying and giving up
//! - **Consumer**: [`consumer`] ties the above to a [`source::StreamSource`]
//! - **MongoDB**: [`mongo`] is the driver-backed source
//!
//! # Example
//!
//! ```rust
//! use tidewater_core::event::{ChangeEvent, ChangeOperation};
//!
//! fn describe(event: &ChangeEvent) -> &'static str {
//!     match &event.operation {
//!         ChangeOperation::Insert(_) => "New document inserted",
//!         ChangeOperation::Update(_) => "Document updated",
//!         ChangeOperation::Delete(_) => "Document deleted",
//!         ChangeOperation::Replace(_) => "Document replaced",
//!         ChangeOperation::Other(_) => "Other operation",
//!     }
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod metrics;
pub mod mongo;
pub mod reconnect;
pub mod source;
pub mod state;

pub use config::WorkerConfig;
pub use consumer::{ChangeStreamConsumer, ConnectionState, ShutdownHandle};
pub use error::FatalError;
