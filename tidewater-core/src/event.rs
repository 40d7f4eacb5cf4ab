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

//! Change stream event representation.
//!
//! A [`ChangeEvent`] is decoded exactly once, at the source boundary, into a
//! tagged [`ChangeOperation`]. Each variant carries only the fields that are
//! meaningful for that operation, so downstream code matches on the variant
//! instead of probing optional fields.
//!
//! # Examples
//!
//! ```rust
//! use tidewater_core::event::{ChangeEvent, ChangeOperation, InsertChange, Namespace, ResumeToken};
//! use bson::doc;
//!
//! let event = ChangeEvent::new(
//!     ResumeToken::new(doc! { "_data": "8263A1" }),
//!     Namespace::new("mydb", "users"),
//!     ChangeOperation::Insert(InsertChange {
//!         document_key: Some(doc! { "_id": "doc1" }),
//!         full_document: doc! { "_id": "doc1", "name": "Alice" },
//!     }),
//! );
//!
//! assert!(event.is_insert());
//! assert_eq!(event.namespace.full_name(), "mydb.users");
//! ```

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Error raised when a driver event cannot be decoded into a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// The resume token could not be represented as a BSON document
    #[error("Failed to convert resume token: {0}")]
    ResumeToken(String),

    /// A field required by the operation kind was absent
    #[error("{operation} event is missing required field `{field}`")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}

/// Opaque position in a change stream.
///
/// Tokens are only ever stored and handed back to the source. They support
/// equality but deliberately no ordering: two tokens from different
/// reconnections are not comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Document);

impl ResumeToken {
    /// Wraps a raw token document as produced by the server.
    #[must_use]
    pub fn new(raw: Document) -> Self {
        Self(raw)
    }

    /// Borrows the raw token document.
    #[must_use]
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    /// Consumes the token, returning the raw document.
    #[must_use]
    pub fn into_document(self) -> Document {
        self.0
    }
}

impl From<Document> for ResumeToken {
    fn from(raw: Document) -> Self {
        Self(raw)
    }
}

/// Database and collection an event originated from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name (empty for database-level events)
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Coarse classification of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Replace,
    Other,
}

impl OperationKind {
    /// Returns the kind as a static label, suitable for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertChange {
    /// `_id` (and shard key, if sharded) of the new document
    pub document_key: Option<Document>,

    /// The inserted document
    pub full_document: Document,
}

/// Payload of an in-place update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateChange {
    pub document_key: Option<Document>,

    /// Fields that were added or modified, keyed by dotted path
    pub updated_fields: Document,

    /// Fields that were removed from the document
    pub removed_fields: BTreeSet<String>,

    /// Arrays that were truncated by the update
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated_arrays: Vec<TruncatedArray>,

    /// Post-image, present only when the stream requests an update lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,
}

/// Describes an array field shortened by an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedArray {
    /// Field path to the array
    pub field: String,

    /// New size of the array after truncation
    pub new_size: u32,
}

/// Payload of a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteChange {
    /// Key of the removed document
    pub document_key: Document,
}

/// Payload of a whole-document replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceChange {
    pub document_key: Option<Document>,

    /// The replacement document
    pub full_document: Document,
}

/// Any operation without a dedicated variant (`invalidate`, `drop`, `rename`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherChange {
    /// Operation type exactly as reported by the server
    pub operation_type: String,
}

/// Kind-specific payload of a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operationType", rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert(InsertChange),
    Update(UpdateChange),
    Delete(DeleteChange),
    Replace(ReplaceChange),
    Other(OtherChange),
}

impl ChangeOperation {
    /// Returns the coarse kind of this operation.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Insert(_) => OperationKind::Insert,
            Self::Update(_) => OperationKind::Update,
            Self::Delete(_) => OperationKind::Delete,
            Self::Replace(_) => OperationKind::Replace,
            Self::Other(_) => OperationKind::Other,
        }
    }
}

/// A single change stream event.
///
/// Immutable once decoded. The `resume_token` identifies the position
/// immediately after this event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Resume position for this event
    pub resume_token: ResumeToken,

    /// Namespace (database + collection) where the operation occurred
    pub namespace: Namespace,

    /// Oplog time of the operation, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_time: Option<DateTime<Utc>>,

    /// What happened
    pub operation: ChangeOperation,
}

impl ChangeEvent {
    /// Creates an event without a cluster time.
    #[must_use]
    pub fn new(
        resume_token: ResumeToken,
        namespace: Namespace,
        operation: ChangeOperation,
    ) -> Self {
        Self {
            resume_token,
            namespace,
            cluster_time: None,
            operation,
        }
    }

    /// Sets the cluster time.
    #[must_use]
    pub fn with_cluster_time(mut self, cluster_time: DateTime<Utc>) -> Self {
        self.cluster_time = Some(cluster_time);
        self
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    #[inline]
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.kind() == OperationKind::Insert
    }

    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.kind() == OperationKind::Update
    }

    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind() == OperationKind::Delete
    }

    #[inline]
    #[must_use]
    pub fn is_replace(&self) -> bool {
        self.kind() == OperationKind::Replace
    }

    /// Returns the document key, for operations that carry one.
    #[must_use]
    pub fn document_key(&self) -> Option<&Document> {
        match &self.operation {
            ChangeOperation::Insert(c) => c.document_key.as_ref(),
            ChangeOperation::Update(c) => c.document_key.as_ref(),
            ChangeOperation::Delete(c) => Some(&c.document_key),
            ChangeOperation::Replace(c) => c.document_key.as_ref(),
            ChangeOperation::Other(_) => None,
        }
    }

    /// Returns the `_id` from the document key, if present.
    #[must_use]
    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key()?.get("_id")
    }
}

/// Decoding from the MongoDB driver's event type.
///
/// Operation-specific payloads are validated here so that the rest of the
/// crate never sees a half-populated event.
impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let resume_token = bson::to_document(&event.id)
            .map(ResumeToken)
            .map_err(|e| ConversionError::ResumeToken(e.to_string()))?;

        let namespace = event
            .ns
            .map(|ns| Namespace::new(ns.db, ns.coll.unwrap_or_default()))
            .unwrap_or_else(|| Namespace::new(String::new(), String::new()));

        let cluster_time = event.cluster_time.and_then(cluster_time_from);

        let operation = match event.operation_type {
            MongoOpType::Insert => ChangeOperation::Insert(InsertChange {
                document_key: event.document_key,
                full_document: event.full_document.ok_or(ConversionError::MissingField {
                    operation: "insert",
                    field: "fullDocument",
                })?,
            }),
            MongoOpType::Update => {
                let description =
                    event
                        .update_description
                        .ok_or(ConversionError::MissingField {
                            operation: "update",
                            field: "updateDescription",
                        })?;
                ChangeOperation::Update(UpdateChange {
                    document_key: event.document_key,
                    updated_fields: description.updated_fields,
                    removed_fields: description.removed_fields.into_iter().collect(),
                    truncated_arrays: description
                        .truncated_arrays
                        .unwrap_or_default()
                        .into_iter()
                        .map(|ta| TruncatedArray {
                            field: ta.field,
                            new_size: u32::try_from(ta.new_size).unwrap_or(0),
                        })
                        .collect(),
                    full_document: event.full_document,
                })
            }
            MongoOpType::Delete => ChangeOperation::Delete(DeleteChange {
                document_key: event.document_key.ok_or(ConversionError::MissingField {
                    operation: "delete",
                    field: "documentKey",
                })?,
            }),
            MongoOpType::Replace => ChangeOperation::Replace(ReplaceChange {
                document_key: event.document_key,
                full_document: event.full_document.ok_or(ConversionError::MissingField {
                    operation: "replace",
                    field: "fullDocument",
                })?,
            }),
            MongoOpType::Invalidate => other("invalidate"),
            MongoOpType::Drop => other("drop"),
            MongoOpType::DropDatabase => other("dropDatabase"),
            MongoOpType::Rename => other("rename"),
            MongoOpType::Other(name) => other(&name),
            unknown => other(&format!("{unknown:?}")),
        };

        Ok(Self {
            resume_token,
            namespace,
            cluster_time,
            operation,
        })
    }
}

fn other(operation_type: &str) -> ChangeOperation {
    ChangeOperation::Other(OtherChange {
        operation_type: operation_type.to_string(),
    })
}

/// Converts a cluster timestamp, carrying the increment as nanoseconds.
///
/// Operations within one second keep their order for any increment below
/// one billion.
fn cluster_time_from(ts: bson::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::from(ts.time), ts.increment.min(999_999_999))
}
