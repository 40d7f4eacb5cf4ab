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

//! Change stream consumer.
//!
//! [`ChangeStreamConsumer`] owns one subscription at a time. For every event
//! it:
//!
//! 1. offers the event to the [`EventDispatcher`]
//! 2. commits the event's resume token to the [`ResumeTokenStore`]
//! 3. resets the [`ReconnectionController`]
//!
//! On failure the subscription is released and the controller decides
//! between reopening after a fixed delay (from the last committed token) and
//! giving up with a [`FatalError`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle --open--> Streaming --failure--> Faulted --retry--> Reconnecting
//!                    ^                     |                    |
//!                    +------ reopen -------+--- give up ---> Terminated
//! ```
//!
//! A [`ShutdownHandle`] stops [`run`](ChangeStreamConsumer::run) from any
//! task, including while a reconnect delay is pending.
//!
//! # Example
//!
//! ```rust,no_run
//! use tidewater_core::consumer::ChangeStreamConsumer;
//! use tidewater_core::dispatch::LoggingHandler;
//! use tidewater_core::mongo::MongoSource;
//! use tidewater_core::reconnect::{ReconnectionController, RetryPolicy};
//! use mongodb::Client;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/?replicaSet=rs0").await?;
//! let source = MongoSource::new(client.database("shop").collection("orders"));
//!
//! let mut consumer = ChangeStreamConsumer::new(source, LoggingHandler)
//!     .with_controller(ReconnectionController::new(
//!         3,
//!         Duration::from_secs(2),
//!         RetryPolicy::Uniform,
//!     ));
//!
//! let shutdown = consumer.shutdown_handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.close();
//! });
//!
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::WorkerConfig;
use crate::dispatch::{ChangeHandler, EventDispatcher};
use crate::error::{ConnectionError, Failure, FatalError, SourceFailure, StreamError};
use crate::event::{ChangeEvent, ResumeToken};
use crate::metrics;
use crate::reconnect::{ReconnectDecision, ReconnectionController};
use crate::source::{StreamSource, Subscription};
use crate::state::ResumeTokenStore;
use bson::Document;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Connection lifecycle of a consumer.
///
/// The discriminants are exported as the `tidewater_connection_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// No subscription; not yet opened or shut down
    Idle = 0,

    /// A subscription is open and delivering events
    Streaming = 1,

    /// The source reported a failure; waiting on the controller
    Faulted = 2,

    /// A reopen is scheduled
    Reconnecting = 3,

    /// Retries exhausted. Terminal.
    Terminated = 4,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Faulted => "faulted",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests shutdown of a running consumer.
///
/// Cloneable and usable from any task. Closing more than once is a no-op.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signals the consumer to stop. A pending reconnect is cancelled and
    /// the active subscription is released.
    pub fn close(&self) {
        let already = self.tx.send_replace(true);
        if !already {
            info!("Shutdown requested");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // An error means every sender is gone, which also ends the consumer.
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Orchestrates a [`StreamSource`] subscription, event dispatch, resume
/// token tracking and bounded reconnection.
pub struct ChangeStreamConsumer<S: StreamSource, H> {
    source: S,
    dispatcher: EventDispatcher<H>,
    store: ResumeTokenStore,
    controller: ReconnectionController,
    pipeline: Vec<Document>,
    cold_start: Option<ResumeToken>,
    subscription: Option<S::Subscription>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl<S, H> ChangeStreamConsumer<S, H>
where
    S: StreamSource,
    H: ChangeHandler,
{
    /// Creates an idle consumer with default reconnection settings
    /// (10 attempts, 5s interval, uniform policy) and no filter.
    pub fn new(source: S, handler: H) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            source,
            dispatcher: EventDispatcher::new(handler),
            store: ResumeTokenStore::new(),
            controller: ReconnectionController::new(
                crate::config::DEFAULT_MAX_RECONNECT_ATTEMPTS,
                crate::config::DEFAULT_RECONNECT_INTERVAL,
                crate::reconnect::RetryPolicy::default(),
            ),
            pipeline: Vec::new(),
            cold_start: None,
            subscription: None,
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Creates a consumer using the pipeline, reconnection settings and
    /// cold-start token from `config`.
    pub fn from_config(source: S, handler: H, config: &WorkerConfig) -> Self {
        let mut consumer = Self::new(source, handler)
            .with_pipeline(config.pipeline.clone())
            .with_controller(ReconnectionController::new(
                config.max_reconnect_attempts,
                config.reconnect_interval,
                config.retry_policy,
            ));
        consumer.cold_start = config.resume_after.clone();
        consumer
    }

    /// Sets the aggregation stages used when `run` opens the stream.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Sets the position used until the first event is committed.
    #[must_use]
    pub fn with_resume_after(mut self, token: ResumeToken) -> Self {
        self.cold_start = Some(token);
        self
    }

    #[must_use]
    pub fn with_controller(mut self, controller: ReconnectionController) -> Self {
        self.controller = controller;
        self
    }

    /// Uses an existing store, e.g. one the host also reads from.
    #[must_use]
    pub fn with_store(mut self, store: ResumeTokenStore) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Returns a receiver notified on every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ResumeTokenStore {
        &self.store
    }

    #[must_use]
    pub fn controller(&self) -> &ReconnectionController {
        &self.controller
    }

    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher<H> {
        &self.dispatcher
    }

    /// Returns true while a subscription is held.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.subscription.is_some()
    }

    /// Opens a subscription filtered by `pipeline`, resuming after
    /// `resume_from` when given.
    ///
    /// Any subscription already held is closed first; close failures are
    /// logged and ignored. The pipeline is kept for later reopens. If the
    /// held subscription was released and the new one cannot be opened,
    /// the consumer is left [`Faulted`](ConnectionState::Faulted).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the source cannot open the stream or
    /// the consumer has terminated.
    pub async fn open(
        &mut self,
        pipeline: Vec<Document>,
        resume_from: Option<ResumeToken>,
    ) -> Result<(), ConnectionError> {
        self.pipeline = pipeline;
        self.open_subscription(resume_from.as_ref()).await
    }

    /// Consumes the stream until shutdown or a fatal failure.
    ///
    /// Opens the stream first if no subscription is held, resuming from the
    /// last committed token or the cold-start token.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError`] when the controller gives up. The consumer is
    /// [`Terminated`](ConnectionState::Terminated) afterwards.
    #[instrument(skip(self), fields(source = %self.source.describe()))]
    pub async fn run(&mut self) -> Result<(), FatalError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!("Starting change stream consumer");

        loop {
            if self.is_shutting_down() {
                break;
            }

            if self.subscription.is_none() {
                let resume = self.resume_position();
                let opened = tokio::select! {
                    biased;
                    () = shutdown_requested(&mut shutdown) => break,
                    opened = self.open_subscription(resume.as_ref()) => opened,
                };

                if let Err(e) = opened {
                    if self.recover(Failure::from(e), &mut shutdown).await? {
                        continue;
                    }
                    break;
                }
            }

            let Some(subscription) = self.subscription.as_mut() else {
                continue;
            };

            let next = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                next = subscription.next() => next,
            };

            let failure = match next {
                Some(Ok(event)) => {
                    self.process(event).await;
                    continue;
                }
                Some(Err(e)) => Failure::from(e),
                None => Failure::from(StreamError::Ended),
            };

            if !self.recover(failure, &mut shutdown).await? {
                break;
            }
        }

        self.close().await;
        info!("Change stream consumer stopped");
        Ok(())
    }

    /// Releases the active subscription, if any, and returns to
    /// [`Idle`](ConnectionState::Idle).
    ///
    /// Safe to call any number of times. To stop a consumer that is
    /// currently inside [`run`](Self::run), use a [`ShutdownHandle`].
    pub async fn close(&mut self) {
        self.release_subscription().await;
        self.set_state(ConnectionState::Idle);
    }

    async fn open_subscription(
        &mut self,
        resume_from: Option<&ResumeToken>,
    ) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Terminated {
            return Err(ConnectionError(SourceFailure::new(
                "consumer has terminated",
            )));
        }

        let released = self.release_subscription().await;

        debug!(
            stages = self.pipeline.len(),
            resuming = resume_from.is_some(),
            "Opening change stream"
        );
        match self.source.open(&self.pipeline, resume_from).await {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.set_state(ConnectionState::Streaming);
                Ok(())
            }
            Err(e) => {
                // No stream is held past this point.
                if released {
                    self.set_state(ConnectionState::Faulted);
                }
                Err(e)
            }
        }
    }

    /// Dispatches, then commits the token, then resets the failure count.
    async fn process(&mut self, event: ChangeEvent) {
        self.dispatcher.dispatch(&event).await;

        let kind = event.kind();
        self.store.set(event.resume_token);
        self.controller.on_success();
        metrics::increment_events_processed(kind.as_str());
    }

    /// Handles a failure. Returns `Ok(true)` to reopen, `Ok(false)` if
    /// shutdown arrived during the delay.
    async fn recover(
        &mut self,
        failure: Failure,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, FatalError> {
        self.set_state(ConnectionState::Faulted);
        metrics::increment_stream_failures(failure.category());
        self.release_subscription().await;

        match self.controller.on_failure(&failure) {
            ReconnectDecision::Retry { attempt, delay } => {
                self.set_state(ConnectionState::Reconnecting);
                metrics::increment_reconnect_attempts();
                info!(
                    attempt,
                    max_attempts = self.controller.max_attempts(),
                    delay_ms = duration_millis(delay),
                    "Reconnecting to change stream"
                );

                tokio::select! {
                    biased;
                    () = shutdown_requested(shutdown) => {
                        info!("Pending reconnect cancelled");
                        Ok(false)
                    }
                    () = tokio::time::sleep(delay) => Ok(true),
                }
            }
            ReconnectDecision::GiveUp {
                attempts,
                retriable,
            } => {
                self.set_state(ConnectionState::Terminated);
                error!(attempts, error = %failure, "Giving up on change stream");

                if retriable {
                    Err(FatalError::MaxAttemptsExceeded {
                        attempts,
                        max_attempts: self.controller.max_attempts(),
                        last_failure: failure,
                    })
                } else {
                    Err(FatalError::NonRetriable(failure))
                }
            }
        }
    }

    /// Closes the held subscription exactly once. Errors are logged.
    /// Closes and drops the held subscription. Returns whether one was held.
    async fn release_subscription(&mut self) -> bool {
        let Some(mut subscription) = self.subscription.take() else {
            return false;
        };

        match subscription.close().await {
            Ok(()) => debug!("Change stream closed"),
            Err(e) => warn!(error = %e, "Failed to close change stream, continuing"),
        }
        true
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn resume_position(&self) -> Option<ResumeToken> {
        self.store.get().or_else(|| self.cold_start.clone())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Terminated {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });

        if changed {
            debug!(from = %previous, to = %next, "Connection state changed");
            metrics::set_connection_state(next);
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
