//! Custom Change Handler Example
//!
//! Watches `testdb.users` for inserts and updates only, counting events per
//! operation with a custom [`ChangeHandler`]. The stream reopens from the last
//! processed event if the connection drops.
//!
//! # Prerequisites
//!
//! Start MongoDB (replica set required for change streams):
//! ```bash
//! docker run -d --name mongodb -p 27017:27017 \
//!   mongo:7.0 --replSet rs0
//!
//! # Initialize replica set
//! docker exec mongodb mongosh --eval "rs.initiate()"
//! ```
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p tidewater-core --example custom_handler
//! ```
//!
//! # Generate Test Data
//!
//! In another terminal:
//! ```bash
//! docker exec mongodb mongosh testdb --eval '
//!   db.users.insertOne({name: "Alice", email: "alice@example.com", age: 30});
//!   db.users.updateOne({name: "Alice"}, {$set: {age: 31}, $unset: {email: ""}})
//! '
//! ```

use bson::doc;
use mongodb::Client;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidewater_core::consumer::ChangeStreamConsumer;
use tidewater_core::dispatch::ChangeHandler;
use tidewater_core::error::HandlerError;
use tidewater_core::event::{ChangeEvent, InsertChange, UpdateChange};
use tidewater_core::mongo::MongoSource;
use tidewater_core::reconnect::{ReconnectionController, RetryPolicy};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Counts inserts and updates, logging a short summary of each.
#[derive(Debug, Default)]
struct CountingHandler {
    inserts: AtomicU64,
    updates: AtomicU64,
}

#[async_trait::async_trait]
impl ChangeHandler for CountingHandler {
    async fn on_insert(
        &self,
        event: &ChangeEvent,
        change: &InsertChange,
    ) -> Result<(), HandlerError> {
        let count = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            count,
            namespace = %event.namespace,
            id = ?event.document_id(),
            fields = change.full_document.len(),
            "Insert"
        );
        Ok(())
    }

    async fn on_update(
        &self,
        event: &ChangeEvent,
        change: &UpdateChange,
    ) -> Result<(), HandlerError> {
        let count = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            count,
            id = ?event.document_id(),
            updated = ?change.updated_fields.keys().collect::<Vec<_>>(),
            removed = ?change.removed_fields,
            "Update"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let uri = std::env::var("MONGODB_URI").unwrap_or_else(|_| {
        "mongodb://localhost:27017/?replicaSet=rs0&directConnection=true".to_string()
    });
    let client = Client::with_uri_str(&uri).await?;
    let source = MongoSource::new(client.database("testdb").collection("users"))
        .full_document_update_lookup();

    let handler = Arc::new(CountingHandler::default());
    let mut consumer = ChangeStreamConsumer::new(source, Arc::clone(&handler))
        .with_pipeline(vec![
            doc! { "$match": { "operationType": { "$in": ["insert", "update"] } } },
        ])
        .with_controller(ReconnectionController::new(
            5,
            Duration::from_secs(2),
            RetryPolicy::TransientOnly,
        ));

    let shutdown = consumer.shutdown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            shutdown.close();
        }
    });

    info!("Watching testdb.users, press Ctrl+C to stop");
    consumer.run().await?;

    info!(
        inserts = handler.inserts.load(Ordering::Relaxed),
        updates = handler.updates.load(Ordering::Relaxed),
        last_token = ?consumer.store().get(),
        "Stopped"
    );

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tidewater_core=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}
