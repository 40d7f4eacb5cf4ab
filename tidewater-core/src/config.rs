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

//! Worker configuration.
//!
//! Built either programmatically through [`WorkerConfig::builder`] or from
//! environment variables with [`WorkerConfig::from_env`]:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `MONGODB_URI` | `mongodb://localhost:27017/` |
//! | `MONGODB_DB` | `mdlcDatabase` |
//! | `MONGODB_COLLECTION` | `mdlcCollection` |
//! | `PIPELINE_FILTER` | `[]` (JSON array of aggregation stages) |
//! | `RECONNECT_INTERVAL` | `5000` (milliseconds) |
//! | `MAX_RECONNECT_ATTEMPTS` | `10` |
//! | `RESUME_AFTER` | unset (JSON resume token document) |
//! | `RETRY_POLICY` | `uniform` (`uniform` or `transient`) |
//! | `LOG_LEVEL` | `info` |
//!
//! # Example
//!
//! ```rust
//! use tidewater_core::config::WorkerConfig;
//! use bson::doc;
//! use std::time::Duration;
//!
//! let config = WorkerConfig::builder()
//!     .database("shop")
//!     .collection("orders")
//!     .pipeline(vec![doc! { "$match": { "operationType": { "$in": ["insert", "update"] } } }])
//!     .reconnect_interval(Duration::from_secs(2))
//!     .max_reconnect_attempts(3)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.max_reconnect_attempts, 3);
//! ```

use crate::event::ResumeToken;
use crate::reconnect::RetryPolicy;
use bson::Document;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MONGODB_URI: &str = "mongodb://localhost:27017/";
pub const DEFAULT_DATABASE: &str = "mdlcDatabase";
pub const DEFAULT_COLLECTION: &str = "mdlcCollection";
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors raised while building a [`WorkerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable could not be parsed
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    /// A field failed validation
    #[error("Configuration error: {0}")]
    Validation(String),
}

/// Settings for a single-collection worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// MongoDB connection string
    pub mongodb_uri: String,

    /// Database to watch
    pub database: String,

    /// Collection to watch
    pub collection: String,

    /// Aggregation stages applied to the change stream (empty = no filter)
    pub pipeline: Vec<Document>,

    /// Fixed delay between a failure and the next reopen
    pub reconnect_interval: Duration,

    /// Consecutive failures tolerated before giving up
    pub max_reconnect_attempts: u32,

    /// Cold-start position, used until the first event is committed
    pub resume_after: Option<ResumeToken>,

    /// Which failures are eligible for retry
    pub retry_policy: RetryPolicy,

    /// Log filter directive (e.g. "info", "debug,mongodb=warn")
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mongodb_uri: DEFAULT_MONGODB_URI.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            pipeline: Vec::new(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            resume_after: None,
            retry_policy: RetryPolicy::Uniform,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is malformed or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Unset keys fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value is malformed or validation fails.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(uri) = lookup("MONGODB_URI") {
            builder = builder.mongodb_uri(uri);
        }
        if let Some(db) = lookup("MONGODB_DB") {
            builder = builder.database(db);
        }
        if let Some(coll) = lookup("MONGODB_COLLECTION") {
            builder = builder.collection(coll);
        }
        if let Some(raw) = lookup("PIPELINE_FILTER") {
            builder = builder.pipeline(parse_pipeline(&raw)?);
        }
        if let Some(raw) = lookup("RECONNECT_INTERVAL") {
            let ms: u64 = parse_number("RECONNECT_INTERVAL", &raw)?;
            builder = builder.reconnect_interval(Duration::from_millis(ms));
        }
        if let Some(raw) = lookup("MAX_RECONNECT_ATTEMPTS") {
            builder = builder.max_reconnect_attempts(parse_number("MAX_RECONNECT_ATTEMPTS", &raw)?);
        }
        if let Some(raw) = lookup("RESUME_AFTER") {
            let token = parse_json_document("RESUME_AFTER", &raw)?;
            builder = builder.resume_after(ResumeToken::new(token));
        }
        if let Some(raw) = lookup("RETRY_POLICY") {
            let policy = raw
                .parse::<RetryPolicy>()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: "RETRY_POLICY",
                    reason,
                })?;
            builder = builder.retry_policy(policy);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            builder = builder.log_level(level);
        }

        builder.build()
    }

    /// Checks field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the URI, database or collection
    /// is empty, or the reconnect interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mongodb_uri.trim().is_empty() {
            return Err(ConfigError::Validation("mongodb_uri must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Validation("database must not be empty".to_string()));
        }
        if self.collection.trim().is_empty() {
            return Err(ConfigError::Validation("collection must not be empty".to_string()));
        }
        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::Validation(
                "reconnect_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`WorkerConfig`]. Unset fields take the documented defaults.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    mongodb_uri: Option<String>,
    database: Option<String>,
    collection: Option<String>,
    pipeline: Vec<Document>,
    reconnect_interval: Option<Duration>,
    max_reconnect_attempts: Option<u32>,
    resume_after: Option<ResumeToken>,
    retry_policy: Option<RetryPolicy>,
    log_level: Option<String>,
}

impl WorkerConfigBuilder {
    #[must_use]
    pub fn mongodb_uri(mut self, uri: impl Into<String>) -> Self {
        self.mongodb_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Sets the aggregation stages used to filter events.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Sets the fixed reconnect delay. Default: 5000ms
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    /// Sets the failure budget. Default: 10
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.resume_after = Some(token);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if validation fails.
    pub fn build(self) -> Result<WorkerConfig, ConfigError> {
        let config = WorkerConfig {
            mongodb_uri: self
                .mongodb_uri
                .unwrap_or_else(|| DEFAULT_MONGODB_URI.to_string()),
            database: self.database.unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            collection: self
                .collection
                .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            pipeline: self.pipeline,
            reconnect_interval: self.reconnect_interval.unwrap_or(DEFAULT_RECONNECT_INTERVAL),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            resume_after: self.resume_after,
            retry_policy: self.retry_policy.unwrap_or_default(),
            log_level: self.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key,
            reason: format!("'{raw}': {e}"),
        })
}

fn parse_json_document(key: &'static str, raw: &str) -> Result<Document, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
        })?;
    json_to_document(key, &value)
}

fn json_to_document(key: &'static str, value: &serde_json::Value) -> Result<Document, ConfigError> {
    if !value.is_object() {
        return Err(ConfigError::InvalidValue {
            key,
            reason: format!("expected a JSON object, got {value}"),
        });
    }
    bson::to_document(value).map_err(|e| ConfigError::InvalidValue {
        key,
        reason: e.to_string(),
    })
}

/// Parses `PIPELINE_FILTER`: a JSON array of stage objects.
fn parse_pipeline(raw: &str) -> Result<Vec<Document>, ConfigError> {
    const KEY: &str = "PIPELINE_FILTER";

    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            key: KEY,
            reason: e.to_string(),
        })?;

    let serde_json::Value::Array(stages) = value else {
        return Err(ConfigError::InvalidValue {
            key: KEY,
            reason: "expected a JSON array of stages".to_string(),
        });
    };

    stages.iter().map(|stage| json_to_document(KEY, stage)).collect()
}
