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

//! The boundary between the consumer and a change stream backend.
//!
//! A [`StreamSource`] opens [`Subscription`]s. A subscription is a lazy,
//! infinite [`Stream`] whose items are explicit results: an event, or the
//! error that ends the subscription. The consumer never inspects backend
//! types; [`MongoSource`](crate::mongo::MongoSource) is the production
//! implementation and tests script their own.

use crate::error::{CloseError, ConnectionError, StreamError};
use crate::event::{ChangeEvent, ResumeToken};
use async_trait::async_trait;
use bson::Document;
use futures::Stream;

/// An open change stream.
///
/// Yields `Ok(event)` in stream order. An `Err` ends the subscription; the
/// consumer will not poll it again.
#[async_trait]
pub trait Subscription: Stream<Item = Result<ChangeEvent, StreamError>> + Send + Unpin {
    /// Releases the server-side cursor.
    async fn close(&mut self) -> Result<(), CloseError>;
}

/// Backend capable of opening subscriptions.
#[async_trait]
pub trait StreamSource: Send + Sync {
    type Subscription: Subscription;

    /// Opens a subscription filtered by `pipeline`, resuming after
    /// `resume_after` when given.
    async fn open(
        &self,
        pipeline: &[Document],
        resume_after: Option<&ResumeToken>,
    ) -> Result<Self::Subscription, ConnectionError>;

    /// Human-readable description of what is being watched, for logs.
    fn describe(&self) -> String {
        "change stream".to_string()
    }
}
