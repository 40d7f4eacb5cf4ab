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

//! `MongoDB` change stream source.
//!
//! [`MongoSource`] watches a single collection through the official driver.
//! Driver events are decoded into [`ChangeEvent`]s here, and driver errors
//! are mapped to [`SourceFailure`]s carrying the server code and labels so
//! the retry policy can classify them.
//!
//! # Example
//!
//! ```rust,no_run
//! use tidewater_core::mongo::MongoSource;
//! use tidewater_core::source::StreamSource;
//! use mongodb::Client;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/?replicaSet=rs0").await?;
//! let source = MongoSource::new(client.database("mydb").collection("users"))
//!     .full_document_update_lookup();
//!
//! let subscription = source.open(&[], None).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CloseError, ConnectionError, SourceFailure, StreamError};
use crate::event::{ChangeEvent, ResumeToken};
use crate::source::{StreamSource, Subscription};
use async_trait::async_trait;
use bson::Document;
use futures::{Stream, StreamExt};
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken as MongoResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Collection;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, info};

/// Driver-level change stream settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MongoStreamSettings {
    /// Attach the current document to update events
    pub full_document_on_update: bool,

    /// Cursor batch size
    pub batch_size: Option<u32>,
}

/// Change stream source over one collection.
#[derive(Debug, Clone)]
pub struct MongoSource {
    collection: Collection<Document>,
    settings: MongoStreamSettings,
}

impl MongoSource {
    pub fn new(collection: Collection<Document>) -> Self {
        Self {
            collection,
            settings: MongoStreamSettings::default(),
        }
    }

    /// Requests the post-image of updated documents (`fullDocument: updateLookup`).
    #[must_use]
    pub fn full_document_update_lookup(mut self) -> Self {
        self.settings.full_document_on_update = true;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.settings.batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn settings(&self) -> MongoStreamSettings {
        self.settings
    }
}

/// Builds driver options, translating the resume token into the driver's type.
///
/// The token is stored as a plain document and round-tripped through BSON
/// bytes into the driver's opaque token.
pub(crate) fn change_stream_options(
    settings: MongoStreamSettings,
    resume_after: Option<&ResumeToken>,
) -> Result<ChangeStreamOptions, SourceFailure> {
    let mut options = ChangeStreamOptions::default();

    if settings.full_document_on_update {
        options.full_document = Some(FullDocumentType::UpdateLookup);
    }
    options.batch_size = settings.batch_size;

    if let Some(token) = resume_after {
        let bytes = bson::to_vec(token.as_document())
            .map_err(|e| SourceFailure::new(format!("Failed to encode resume token: {e}")))?;
        let resume_token = bson::from_slice::<MongoResumeToken>(&bytes)
            .map_err(|e| SourceFailure::new(format!("Failed to decode resume token: {e}")))?;
        options.resume_after = Some(resume_token);
    }

    Ok(options)
}

#[async_trait]
impl StreamSource for MongoSource {
    type Subscription = MongoSubscription;

    async fn open(
        &self,
        pipeline: &[Document],
        resume_after: Option<&ResumeToken>,
    ) -> Result<MongoSubscription, ConnectionError> {
        let options = change_stream_options(self.settings, resume_after)?;

        if let Some(token) = resume_after {
            info!("Resuming change stream after token");
            debug!(?token, "Resume token");
        }

        let stream = if pipeline.is_empty() {
            self.collection.watch().with_options(options).await
        } else {
            self.collection
                .watch()
                .pipeline(pipeline.to_vec())
                .with_options(options)
                .await
        }
        .map_err(|e| ConnectionError(SourceFailure::from_mongo_error(e)))?;

        info!(namespace = %self.describe(), "Watching for changes");

        Ok(MongoSubscription {
            stream: Some(stream),
        })
    }

    fn describe(&self) -> String {
        let ns = self.collection.namespace();
        format!("{}.{}", ns.db, ns.coll)
    }
}

/// An open `MongoDB` change stream.
pub struct MongoSubscription {
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
}

impl Stream for MongoSubscription {
    type Item = Result<ChangeEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };

        match stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(event))) => {
                Poll::Ready(Some(ChangeEvent::try_from(event).map_err(StreamError::from)))
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Some(Err(StreamError::Source(SourceFailure::from_mongo_error(e)))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[async_trait]
impl Subscription for MongoSubscription {
    /// Drops the driver stream, which kills the server cursor in the background.
    async fn close(&mut self) -> Result<(), CloseError> {
        if self.stream.take().is_some() {
            debug!("Change stream cursor released");
        }
        Ok(())
    }
}
