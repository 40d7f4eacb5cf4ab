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

//! Tidewater worker
//!
//! Watches one `MongoDB` collection and logs every change. Configured through
//! environment variables (see `tidewater_core::config`). A `.env` file in the
//! working directory or one of its parents is loaded first; variables already
//! set in the environment take precedence over it.
//!
//! ```bash
//! MONGODB_URI="mongodb://localhost:27017/?replicaSet=rs0" \
//! MONGODB_DB=shop MONGODB_COLLECTION=orders \
//! PIPELINE_FILTER='[{"$match": {"operationType": "insert"}}]' \
//! cargo run -p tidewater-worker
//! ```
//!
//! Exits with status 1 when the configuration is invalid, the client cannot
//! be created, or the stream fails more often than `MAX_RECONNECT_ATTEMPTS`
//! in a row.

mod shutdown;

use mongodb::bson::Document;
use mongodb::Client;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use tidewater_core::config::ConfigError;
use tidewater_core::dispatch::LoggingHandler;
use tidewater_core::mongo::MongoSource;
use tidewater_core::{metrics, ChangeStreamConsumer, WorkerConfig};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let (env_file, config) = load_config();
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.log_level);
    if let Some(path) = env_file {
        debug!(path = %path.display(), "Loaded environment file");
    }
    metrics::init_metrics();

    match run(config).await {
        Ok(()) => {
            info!("Worker stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Worker stopped with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: WorkerConfig) -> Result<(), Box<dyn Error>> {
    info!(
        database = %config.database,
        collection = %config.collection,
        stages = config.pipeline.len(),
        max_reconnect_attempts = config.max_reconnect_attempts,
        reconnect_interval_ms =
            u64::try_from(config.reconnect_interval.as_millis()).unwrap_or(u64::MAX),
        retry_policy = %config.retry_policy,
        "Starting Tidewater worker"
    );

    let client = Client::with_uri_str(&config.mongodb_uri).await?;
    let collection = client
        .database(&config.database)
        .collection::<Document>(&config.collection);

    let mut consumer =
        ChangeStreamConsumer::from_config(MongoSource::new(collection), LoggingHandler, &config);

    let listener = shutdown::spawn_listener(consumer.shutdown_handle());
    let result = consumer.run().await;
    listener.abort();
    drop(consumer);

    client.shutdown().await;
    info!("MongoDB client closed");

    result?;
    Ok(())
}

/// Loads `.env` into the process environment, then reads the configuration.
///
/// A missing or unreadable `.env` file is not an error. Returns the path of
/// the file that was loaded, if any.
fn load_config() -> (Option<PathBuf>, Result<WorkerConfig, ConfigError>) {
    let env_file = dotenvy::dotenv().ok();
    (env_file, WorkerConfig::from_env())
}

/// Installs the fmt subscriber. `level` is an `EnvFilter` directive;
/// `RUST_LOG` is used when it does not parse.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}
