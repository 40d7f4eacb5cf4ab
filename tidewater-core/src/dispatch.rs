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

//! Routing of change events to an observer.
//!
//! [`EventDispatcher`] matches on the event's operation and calls the
//! corresponding [`ChangeHandler`] method. Handler failures, including
//! panics, are logged and counted but never reach the consumer: once
//! `dispatch` returns, the event counts as processed.
//!
//! # Example
//!
//! ```rust
//! use tidewater_core::dispatch::{ChangeHandler, EventDispatcher};
//! use tidewater_core::error::HandlerError;
//! use tidewater_core::event::{ChangeEvent, InsertChange};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct InsertCounter(AtomicUsize);
//!
//! #[async_trait::async_trait]
//! impl ChangeHandler for InsertCounter {
//!     async fn on_insert(
//!         &self,
//!         _event: &ChangeEvent,
//!         _change: &InsertChange,
//!     ) -> Result<(), HandlerError> {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//!
//! let dispatcher = EventDispatcher::new(InsertCounter::default());
//! ```

use crate::error::HandlerError;
use crate::event::{
    ChangeEvent, ChangeOperation, DeleteChange, InsertChange, OtherChange, ReplaceChange,
    UpdateChange,
};
use crate::metrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Observer for dispatched events, one method per operation kind.
///
/// Every method defaults to doing nothing, so implementors only override
/// the kinds they care about.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_insert(
        &self,
        event: &ChangeEvent,
        change: &InsertChange,
    ) -> Result<(), HandlerError> {
        let _ = (event, change);
        Ok(())
    }

    async fn on_update(
        &self,
        event: &ChangeEvent,
        change: &UpdateChange,
    ) -> Result<(), HandlerError> {
        let _ = (event, change);
        Ok(())
    }

    async fn on_delete(
        &self,
        event: &ChangeEvent,
        change: &DeleteChange,
    ) -> Result<(), HandlerError> {
        let _ = (event, change);
        Ok(())
    }

    async fn on_replace(
        &self,
        event: &ChangeEvent,
        change: &ReplaceChange,
    ) -> Result<(), HandlerError> {
        let _ = (event, change);
        Ok(())
    }

    async fn on_other(
        &self,
        event: &ChangeEvent,
        change: &OtherChange,
    ) -> Result<(), HandlerError> {
        let _ = (event, change);
        Ok(())
    }
}

#[async_trait]
impl<H: ChangeHandler + ?Sized> ChangeHandler for Arc<H> {
    async fn on_insert(
        &self,
        event: &ChangeEvent,
        change: &InsertChange,
    ) -> Result<(), HandlerError> {
        (**self).on_insert(event, change).await
    }

    async fn on_update(
        &self,
        event: &ChangeEvent,
        change: &UpdateChange,
    ) -> Result<(), HandlerError> {
        (**self).on_update(event, change).await
    }

    async fn on_delete(
        &self,
        event: &ChangeEvent,
        change: &DeleteChange,
    ) -> Result<(), HandlerError> {
        (**self).on_delete(event, change).await
    }

    async fn on_replace(
        &self,
        event: &ChangeEvent,
        change: &ReplaceChange,
    ) -> Result<(), HandlerError> {
        (**self).on_replace(event, change).await
    }

    async fn on_other(
        &self,
        event: &ChangeEvent,
        change: &OtherChange,
    ) -> Result<(), HandlerError> {
        (**self).on_other(event, change).await
    }
}

/// Handler that writes a structured log line per event.
///
/// Summary at `info`, document contents at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl ChangeHandler for LoggingHandler {
    async fn on_insert(
        &self,
        event: &ChangeEvent,
        change: &InsertChange,
    ) -> Result<(), HandlerError> {
        info!(namespace = %event.namespace, "New document inserted");
        debug!(document = ?change.full_document, "Document details");
        Ok(())
    }

    async fn on_update(
        &self,
        event: &ChangeEvent,
        change: &UpdateChange,
    ) -> Result<(), HandlerError> {
        info!(namespace = %event.namespace, "Document updated");
        debug!(updated_fields = ?change.updated_fields, "Updated fields");
        if !change.removed_fields.is_empty() {
            debug!(removed_fields = ?change.removed_fields, "Removed fields");
        }
        Ok(())
    }

    async fn on_delete(
        &self,
        event: &ChangeEvent,
        change: &DeleteChange,
    ) -> Result<(), HandlerError> {
        info!(namespace = %event.namespace, "Document deleted");
        debug!(document_key = ?change.document_key, "Deleted document key");
        Ok(())
    }

    async fn on_replace(
        &self,
        event: &ChangeEvent,
        change: &ReplaceChange,
    ) -> Result<(), HandlerError> {
        info!(namespace = %event.namespace, "Document replaced");
        debug!(document = ?change.full_document, "New document");
        Ok(())
    }

    async fn on_other(
        &self,
        event: &ChangeEvent,
        change: &OtherChange,
    ) -> Result<(), HandlerError> {
        info!(
            namespace = %event.namespace,
            operation_type = %change.operation_type,
            "Other operation"
        );
        debug!(?event, "Change details");
        Ok(())
    }
}

/// Routes each event to the matching [`ChangeHandler`] method.
#[derive(Debug, Clone, Default)]
pub struct EventDispatcher<H> {
    handler: H,
}

impl<H: ChangeHandler> EventDispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Offers `event` to the handler.
    ///
    /// Never fails: handler errors and panics are contained here.
    pub async fn dispatch(&self, event: &ChangeEvent) {
        let kind = event.kind();
        info!(operation = %kind, "Change detected");

        let handled = AssertUnwindSafe(async {
            match &event.operation {
                ChangeOperation::Insert(change) => self.handler.on_insert(event, change).await,
                ChangeOperation::Update(change) => self.handler.on_update(event, change).await,
                ChangeOperation::Delete(change) => self.handler.on_delete(event, change).await,
                ChangeOperation::Replace(change) => self.handler.on_replace(event, change).await,
                ChangeOperation::Other(change) => self.handler.on_other(event, change).await,
            }
        })
        .catch_unwind()
        .await;

        match handled {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(operation = %kind, error = %e, "Change handler failed");
                metrics::increment_handler_failures(kind.as_str());
            }
            Err(_) => {
                error!(operation = %kind, "Change handler panicked");
                metrics::increment_handler_failures(kind.as_str());
            }
        }
    }
}
