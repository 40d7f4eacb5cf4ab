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

//! Integration tests for ChangeStreamConsumer.
//!
//! A scripted source replays a fixed sequence of opens, events and failures
//! and records every `open` call, so reconnection behavior can be checked
//! under paused time.

use async_trait::async_trait;
use bson::{doc, Bson};
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tidewater_core::consumer::{ChangeStreamConsumer, ConnectionState};
use tidewater_core::dispatch::ChangeHandler;
use tidewater_core::error::{
    CloseError, ConnectionError, FatalError, Failure, HandlerError, SourceFailure, StreamError,
};
use tidewater_core::event::{
    ChangeEvent, ChangeOperation, ConversionError, DeleteChange, InsertChange, Namespace,
    OperationKind, ResumeToken, UpdateChange,
};
use tidewater_core::reconnect::{ReconnectionController, RetryPolicy};
use tidewater_core::source::{StreamSource, Subscription};
use tidewater_core::state::ResumeTokenStore;
use tidewater_core::WorkerConfig;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Scripted source
// ---------------------------------------------------------------------------

/// One item yielded by a scripted subscription.
enum Step {
    Event(ChangeEvent),
    Fail(StreamError),
    End,
}

/// Outcome of one `open` call.
enum OpenScript {
    Stream(Vec<Step>),
    Refuse(SourceFailure),
}

#[derive(Debug, Clone)]
struct OpenCall {
    resume_after: Option<ResumeToken>,
    at: Instant,
}

#[derive(Clone, Default)]
struct ScriptedSource {
    scripts: Arc<Mutex<VecDeque<OpenScript>>>,
    opens: Arc<Mutex<Vec<OpenCall>>>,
    closes: Arc<AtomicUsize>,
    fail_close: bool,
}

impl ScriptedSource {
    fn new(scripts: Vec<OpenScript>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            ..Self::default()
        }
    }

    fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    fn opens(&self) -> Vec<OpenCall> {
        self.opens.lock().unwrap().clone()
    }

    fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    type Subscription = ScriptedSubscription;

    async fn open(
        &self,
        _pipeline: &[bson::Document],
        resume_after: Option<&ResumeToken>,
    ) -> Result<ScriptedSubscription, ConnectionError> {
        self.opens.lock().unwrap().push(OpenCall {
            resume_after: resume_after.cloned(),
            at: Instant::now(),
        });

        // An exhausted script opens a stream that stays silent.
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenScript::Stream(Vec::new()));

        match script {
            OpenScript::Stream(steps) => Ok(ScriptedSubscription {
                steps: steps.into(),
                closes: Arc::clone(&self.closes),
                fail_close: self.fail_close,
            }),
            OpenScript::Refuse(failure) => Err(ConnectionError(failure)),
        }
    }

    fn describe(&self) -> String {
        "shop.orders".to_string()
    }
}

struct ScriptedSubscription {
    steps: VecDeque<Step>,
    closes: Arc<AtomicUsize>,
    fail_close: bool,
}

impl Stream for ScriptedSubscription {
    type Item = Result<ChangeEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().steps.pop_front() {
            Some(Step::Event(event)) => Poll::Ready(Some(Ok(event))),
            Some(Step::Fail(err)) => Poll::Ready(Some(Err(err))),
            Some(Step::End) => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    async fn close(&mut self) -> Result<(), CloseError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(CloseError(SourceFailure::new("cursor already killed")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handlers and fixtures
// ---------------------------------------------------------------------------

/// Records each dispatched event along with the token committed at that time.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(OperationKind, Option<ResumeToken>)>>,
    ids: Mutex<Vec<Option<Bson>>>,
    store: Option<ResumeTokenStore>,
}

impl Recorder {
    fn observing(store: ResumeTokenStore) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    fn record(&self, event: &ChangeEvent) {
        let committed = self.store.as_ref().and_then(ResumeTokenStore::get);
        self.seen.lock().unwrap().push((event.kind(), committed));
        self.ids.lock().unwrap().push(event.document_id().cloned());
    }

    fn kinds(&self) -> Vec<OperationKind> {
        self.seen.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    fn ids(&self) -> Vec<Option<Bson>> {
        self.ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeHandler for Recorder {
    async fn on_insert(&self, event: &ChangeEvent, _: &InsertChange) -> Result<(), HandlerError> {
        self.record(event);
        Ok(())
    }

    async fn on_update(&self, event: &ChangeEvent, _: &UpdateChange) -> Result<(), HandlerError> {
        self.record(event);
        Ok(())
    }

    async fn on_delete(&self, event: &ChangeEvent, _: &DeleteChange) -> Result<(), HandlerError> {
        self.record(event);
        Ok(())
    }
}

/// Fails on every event.
struct Broken;

#[async_trait]
impl ChangeHandler for Broken {
    async fn on_insert(&self, _: &ChangeEvent, _: &InsertChange) -> Result<(), HandlerError> {
        Err("downstream unavailable".into())
    }
}

fn token(n: i32) -> ResumeToken {
    ResumeToken::new(doc! { "_data": format!("8263A1F5B2{n:08}") })
}

fn insert(n: i32) -> ChangeEvent {
    ChangeEvent::new(
        token(n),
        Namespace::new("shop", "orders"),
        ChangeOperation::Insert(InsertChange {
            document_key: Some(doc! { "_id": format!("doc{n}") }),
            full_document: doc! { "_id": format!("doc{n}"), "total": n },
        }),
    )
}

fn update(n: i32) -> ChangeEvent {
    ChangeEvent::new(
        token(n),
        Namespace::new("shop", "orders"),
        ChangeOperation::Update(UpdateChange {
            document_key: Some(doc! { "_id": format!("doc{n}") }),
            updated_fields: doc! { "status": "shipped" },
            removed_fields: ["draft".to_string()].into_iter().collect(),
            truncated_arrays: vec![],
            full_document: None,
        }),
    )
}

fn delete(n: i32) -> ChangeEvent {
    ChangeEvent::new(
        token(n),
        Namespace::new("shop", "orders"),
        ChangeOperation::Delete(DeleteChange {
            document_key: doc! { "_id": format!("doc{n}") },
        }),
    )
}

fn network_error() -> StreamError {
    StreamError::Source(SourceFailure::new("connection reset by peer").with_label("NetworkError"))
}

fn refused() -> OpenScript {
    OpenScript::Refuse(SourceFailure::new("server selection timeout").with_code(89))
}

fn controller(max_attempts: u32, interval: Duration) -> ReconnectionController {
    ReconnectionController::new(max_attempts, interval, RetryPolicy::Uniform)
}

/// Polls `cond` under paused time until it holds.
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Event processing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_single_insert_is_dispatched_and_committed() {
    let source = ScriptedSource::new(vec![OpenScript::Stream(vec![
        Step::Event(insert(1)),
        Step::End,
    ])]);
    let recorder = Arc::new(Recorder::default());

    let mut consumer = ChangeStreamConsumer::new(source.clone(), Arc::clone(&recorder))
        .with_controller(controller(0, Duration::from_secs(5)));

    let result = consumer.run().await;

    // max_attempts = 0: the end of stream after the event is fatal
    assert!(matches!(result, Err(FatalError::MaxAttemptsExceeded { attempts: 1, .. })));
    assert_eq!(recorder.kinds(), vec![OperationKind::Insert]);
    assert_eq!(consumer.store().get(), Some(token(1)));
    assert_eq!(recorder.ids(), vec![Some(Bson::String("doc1".into()))]);
    assert_eq!(source.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_position_tracks_every_event() {
    let events = vec![insert(1), update(2), delete(3), insert(4), update(5)];
    let steps: Vec<Step> = events.into_iter().map(Step::Event).collect();
    let source = ScriptedSource::new(vec![OpenScript::Stream(steps)]);

    let store = ResumeTokenStore::new();
    let recorder = Arc::new(Recorder::observing(store.clone()));
    let mut consumer = ChangeStreamConsumer::new(source, Arc::clone(&recorder))
        .with_store(store.clone());
    let shutdown = consumer.shutdown_handle();

    let task = tokio::spawn(async move { consumer.run().await });

    eventually(|| store.get() == Some(token(5))).await;
    shutdown.close();
    task.await.unwrap().unwrap();

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 5);

    // Each event is dispatched before its own token is committed, and
    // after the previous event's token was.
    assert_eq!(seen[0].1, None);
    for (i, (_, committed)) in seen.iter().enumerate().skip(1) {
        assert_eq!(committed, &Some(token(i as i32)));
    }
    assert_eq!(
        recorder.kinds(),
        vec![
            OperationKind::Insert,
            OperationKind::Update,
            OperationKind::Delete,
            OperationKind::Insert,
            OperationKind::Update,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_handler_failures_do_not_stop_consumption() {
    let source = ScriptedSource::new(vec![OpenScript::Stream(vec![
        Step::Event(insert(1)),
        Step::Event(insert(2)),
        Step::Event(insert(3)),
    ])]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Broken);
    let store = consumer.store().clone();
    let shutdown = consumer.shutdown_handle();

    let task = tokio::spawn(async move { consumer.run().await });

    eventually(|| store.get() == Some(token(3))).await;
    shutdown.close();
    task.await.unwrap().unwrap();

    assert_eq!(source.open_count(), 1);
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_single_failure_reconnects_and_resets_attempts() {
    let interval = Duration::from_secs(5);
    let source = ScriptedSource::new(vec![
        OpenScript::Stream(vec![Step::Fail(network_error())]),
        OpenScript::Stream(vec![Step::Event(insert(1))]),
    ]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default())
        .with_controller(controller(3, interval));
    let store = consumer.store().clone();
    let shutdown = consumer.shutdown_handle();
    let mut states = consumer.watch_state();

    let task = tokio::spawn(async move {
        let result = consumer.run().await;
        (result, consumer)
    });

    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();
    assert_eq!(source.open_count(), 1);

    eventually(|| store.get() == Some(token(1))).await;
    shutdown.close();

    let (result, consumer) = task.await.unwrap();
    result.unwrap();

    let opens = source.opens();
    assert_eq!(opens.len(), 2);
    assert!(opens[1].at - opens[0].at >= interval);
    assert_eq!(consumer.controller().attempts(), 0);
    assert_eq!(consumer.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_exceeding_max_attempts() {
    let source = ScriptedSource::new(vec![
        OpenScript::Stream(vec![Step::Fail(network_error())]),
        refused(),
        refused(),
        refused(),
    ]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default())
        .with_controller(controller(3, Duration::from_secs(5)));

    let err = consumer.run().await.unwrap_err();

    match err {
        FatalError::MaxAttemptsExceeded {
            attempts,
            max_attempts,
            last_failure,
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(max_attempts, 3);
            assert!(matches!(last_failure, Failure::Connection(_)));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(consumer.state(), ConnectionState::Terminated);
    assert_eq!(source.open_count(), 4);

    // Terminal: nothing reopens, even when asked directly.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(consumer.open(Vec::new(), None).await.is_err());
    assert_eq!(source.open_count(), 4);
    assert_eq!(consumer.state(), ConnectionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_event_between_failures_restores_budget() {
    let source = ScriptedSource::new(vec![
        OpenScript::Stream(vec![Step::Fail(network_error())]),
        OpenScript::Stream(vec![Step::Event(insert(1)), Step::Fail(network_error())]),
        OpenScript::Stream(vec![Step::Fail(network_error())]),
    ]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default())
        .with_controller(controller(1, Duration::from_millis(100)));

    let err = consumer.run().await.unwrap_err();

    // Without the reset, the second failure would already be fatal.
    assert!(matches!(err, FatalError::MaxAttemptsExceeded { attempts: 2, .. }));
    assert_eq!(source.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reopen_resumes_from_last_committed_token() {
    let source = ScriptedSource::new(vec![
        OpenScript::Stream(vec![Step::Fail(network_error())]),
        OpenScript::Stream(vec![
            Step::Event(insert(1)),
            Step::Event(insert(2)),
            Step::End,
        ]),
        OpenScript::Stream(vec![Step::Fail(network_error())]),
    ]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default())
        .with_resume_after(token(0))
        .with_controller(controller(1, Duration::from_secs(1)));

    consumer.run().await.unwrap_err();

    let resumed: Vec<_> = source.opens().into_iter().map(|o| o.resume_after).collect();
    assert_eq!(
        resumed,
        vec![Some(token(0)), Some(token(0)), Some(token(2))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_policy_stops_on_conversion_error() {
    let source = ScriptedSource::new(vec![OpenScript::Stream(vec![Step::Fail(
        StreamError::Conversion(ConversionError::MissingField {
            operation: "update",
            field: "updateDescription",
        }),
    )])]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default())
        .with_controller(ReconnectionController::new(
            10,
            Duration::from_secs(1),
            RetryPolicy::TransientOnly,
        ));

    let err = consumer.run().await.unwrap_err();

    assert!(matches!(err, FatalError::NonRetriable(Failure::Stream(StreamError::Conversion(_)))));
    assert_eq!(source.open_count(), 1);
    assert_eq!(consumer.state(), ConnectionState::Terminated);
}

// ---------------------------------------------------------------------------
// Subscription lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_reconnect() {
    let source = ScriptedSource::new(vec![OpenScript::Stream(vec![Step::Fail(network_error())])]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default())
        .with_controller(controller(3, Duration::from_secs(60)));
    let shutdown = consumer.shutdown_handle();
    let mut states = consumer.watch_state();

    let task = tokio::spawn(async move {
        let result = consumer.run().await;
        (result, consumer)
    });

    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();
    shutdown.close();
    shutdown.close();

    let (result, consumer) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(consumer.state(), ConnectionState::Idle);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(source.open_count(), 1);
    assert_eq!(source.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_streaming_releases_subscription_once() {
    let source = ScriptedSource::new(vec![OpenScript::Stream(vec![Step::Event(insert(1))])]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default());
    let store = consumer.store().clone();
    let shutdown = consumer.shutdown_handle();

    let task = tokio::spawn(async move {
        let result = consumer.run().await;
        (result, consumer)
    });

    eventually(|| store.get().is_some()).await;
    shutdown.close();

    let (result, mut consumer) = task.await.unwrap();
    result.unwrap();
    consumer.close().await;

    assert!(!consumer.is_open());
    assert_eq!(source.close_count(), 1);
}

#[tokio::test]
async fn test_open_replaces_existing_subscription() {
    let source = ScriptedSource::new(vec![
        OpenScript::Stream(vec![]),
        OpenScript::Stream(vec![]),
    ]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default());
    assert_eq!(consumer.state(), ConnectionState::Idle);

    consumer.open(Vec::new(), None).await.unwrap();
    assert_eq!(consumer.state(), ConnectionState::Streaming);

    consumer
        .open(vec![doc! { "$match": { "operationType": "insert" } }], Some(token(7)))
        .await
        .unwrap();

    assert_eq!(source.open_count(), 2);
    assert_eq!(source.close_count(), 1);
    assert_eq!(source.opens()[1].resume_after, Some(token(7)));

    consumer.close().await;
    consumer.close().await;
    assert_eq!(source.close_count(), 2);
    assert_eq!(consumer.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_close_failure_does_not_block_reopen() {
    let source = ScriptedSource::new(vec![
        OpenScript::Stream(vec![]),
        OpenScript::Stream(vec![]),
    ])
    .failing_close();
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default());

    consumer.open(Vec::new(), None).await.unwrap();
    consumer.open(Vec::new(), None).await.unwrap();

    assert!(consumer.is_open());
    assert_eq!(source.open_count(), 2);
    assert_eq!(source.close_count(), 1);
}

#[tokio::test]
async fn test_open_failure_is_reported() {
    let source = ScriptedSource::new(vec![refused()]);
    let mut consumer = ChangeStreamConsumer::new(source, Recorder::default());

    let err = consumer.open(Vec::new(), None).await.unwrap_err();
    assert_eq!(err.0.code, Some(89));
    assert_eq!(consumer.state(), ConnectionState::Idle);
    assert!(!consumer.is_open());
}

#[tokio::test]
async fn test_failed_reopen_leaves_consumer_faulted() {
    let source = ScriptedSource::new(vec![OpenScript::Stream(vec![]), refused()]);
    let mut consumer = ChangeStreamConsumer::new(source.clone(), Recorder::default());
    let state = consumer.watch_state();

    consumer.open(Vec::new(), None).await.unwrap();
    assert_eq!(consumer.state(), ConnectionState::Streaming);

    let err = consumer.open(Vec::new(), Some(token(3))).await.unwrap_err();

    assert_eq!(err.0.code, Some(89));
    assert_eq!(consumer.state(), ConnectionState::Faulted);
    assert_eq!(*state.borrow(), ConnectionState::Faulted);
    assert!(!consumer.is_open());
    assert_eq!(source.open_count(), 2);
    assert_eq!(source.close_count(), 1);

    // A later open recovers from the fault
    consumer.open(Vec::new(), None).await.unwrap();
    assert_eq!(consumer.state(), ConnectionState::Streaming);
}

#[tokio::test(start_paused = true)]
async fn test_from_config_applies_reconnect_settings() {
    let config = WorkerConfig::builder()
        .max_reconnect_attempts(2)
        .reconnect_interval(Duration::from_millis(250))
        .resume_after(token(42))
        .build()
        .unwrap();
    let source = ScriptedSource::new(vec![
        OpenScript::Stream(vec![Step::End]),
        refused(),
        refused(),
    ]);
    let mut consumer =
        ChangeStreamConsumer::from_config(source.clone(), Recorder::default(), &config);

    let err = consumer.run().await.unwrap_err();

    assert!(matches!(err, FatalError::MaxAttemptsExceeded { attempts: 3, max_attempts: 2, .. }));
    let opens = source.opens();
    assert_eq!(opens.len(), 3);
    assert!(opens.iter().all(|o| o.resume_after == Some(token(42))));
    assert!(opens[2].at - opens[1].at >= Duration::from_millis(250));
}
