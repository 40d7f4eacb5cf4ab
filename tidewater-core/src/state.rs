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

//! Latest acknowledged resume position.
//!
//! [`ResumeTokenStore`] holds the token of the last event the consumer has
//! fully handed to its dispatcher. The consumer is the only writer; clones
//! share the same slot, so a host can keep one to observe progress.
//!
//! Tokens live in memory only and are lost on restart.
//!
//! ```rust
//! use tidewater_core::state::ResumeTokenStore;
//! use tidewater_core::event::ResumeToken;
//! use bson::doc;
//!
//! let store = ResumeTokenStore::new();
//! assert!(store.get().is_none());
//!
//! let token = ResumeToken::new(doc! { "_data": "826..." });
//! store.set(token.clone());
//! assert_eq!(store.get(), Some(token));
//! ```

use crate::event::ResumeToken;
use std::sync::{Arc, RwLock};
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct ResumeTokenStore {
    token: Arc<RwLock<Option<ResumeToken>>>,
}

impl ResumeTokenStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `token`.
    #[must_use]
    pub fn with_token(token: ResumeToken) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token))),
        }
    }

    /// Returns the most recently committed token, if any.
    #[must_use]
    pub fn get(&self) -> Option<ResumeToken> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Overwrites the stored token unconditionally.
    pub fn set(&self, token: ResumeToken) {
        trace!(?token, "Committing resume token");
        match self.token.write() {
            Ok(mut guard) => *guard = Some(token),
            Err(poisoned) => *poisoned.into_inner() = Some(token),
        }
    }
}
