//! Retry behaviour of `EventLog::append_event` against a store that loses races.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use chartlog_core::event::{AggregateType, EventKind, EventRecord, NewEvent, Payload};
use chartlog_core::event_store::{EventStore, EventStoreError, StoreFuture};
use chartlog_core::handler::Dispatcher;
use chartlog_core::projection::ReadModel;
use chartlog_core::stream::{AggregateId, Sequence};
use chartlog_runtime::{EventLog, EventLogConfig, RetryPolicy};
use chartlog_testing::{InMemoryEventStore, test_clock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Store whose first `conflicts` commits fail as if another writer won the race.
struct ContendedStore {
    inner: InMemoryEventStore,
    conflicts: usize,
    commits: AtomicUsize,
}

impl ContendedStore {
    fn new(conflicts: usize) -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            conflicts,
            commits: AtomicUsize::new(0),
        }
    }
}

impl EventStore for ContendedStore {
    fn current_sequence(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> StoreFuture<'_, Option<Sequence>> {
        self.inner.current_sequence(aggregate_type, aggregate_id)
    }

    fn commit<'a>(
        &'a self,
        event: EventRecord,
        dispatcher: &'a Dispatcher,
    ) -> StoreFuture<'a, EventRecord> {
        let attempt = self.commits.fetch_add(1, Ordering::SeqCst);
        if attempt < self.conflicts {
            return Box::pin(async move {
                Err(EventStoreError::SequenceConflict {
                    aggregate_type: event.aggregate_type,
                    aggregate_id: event.aggregate_id,
                    sequence: event.sequence,
                })
            });
        }
        self.inner.commit(event, dispatcher)
    }

    fn load_events(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Vec<EventRecord>> {
        self.inner.load_events(aggregate_id)
    }

    fn load_read_model(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Option<ReadModel>> {
        self.inner.load_read_model(aggregate_id)
    }
}

fn log_over(store: Arc<ContendedStore>, max_retries: usize) -> EventLog {
    let config = EventLogConfig {
        retry: RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .jitter(0.0)
            .build(),
        append_timeout: Duration::from_secs(5),
    };
    EventLog::new(store, Arc::new(Dispatcher::standard()))
        .with_clock(Arc::new(test_clock()))
        .with_config(config)
}

fn registration() -> NewEvent {
    NewEvent::new(
        AggregateType::Patient,
        AggregateId::parse("p1").unwrap(),
        EventKind::PatientRegistered,
        Payload::new(),
    )
}

#[tokio::test]
async fn conflicts_are_retried_until_commit() {
    let store = Arc::new(ContendedStore::new(2));
    let log = log_over(Arc::clone(&store), 3);

    let event = log.append_event(registration()).await.unwrap();

    assert!(event.sequence.is_first());
    assert_eq!(store.commits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_the_conflict() {
    let store = Arc::new(ContendedStore::new(usize::MAX));
    let log = log_over(Arc::clone(&store), 3);

    let err = log.append_event(registration()).await.unwrap_err();

    assert!(matches!(err, EventStoreError::SequenceConflict { .. }));
    assert_eq!(store.commits.load(Ordering::SeqCst), 4);
    assert!(store.inner.load_events(AggregateId::new_unchecked("p1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn explicit_sequence_is_never_retried() {
    let store = Arc::new(ContendedStore::new(1));
    let log = log_over(Arc::clone(&store), 3);

    let err = log
        .append_event(registration().with_expected_sequence(Sequence::FIRST))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(store.commits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn try_append_makes_a_single_attempt() {
    let store = Arc::new(ContendedStore::new(1));
    let log = log_over(Arc::clone(&store), 3);

    assert!(log.try_append(&registration()).await.is_err());
    assert!(log.try_append(&registration()).await.is_ok());
    assert_eq!(store.commits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unregistered_pairs_never_reach_the_store() {
    let store = Arc::new(ContendedStore::new(0));
    let log = log_over(Arc::clone(&store), 3);

    let mismatched = NewEvent::new(
        AggregateType::Lab,
        AggregateId::parse("lab-1").unwrap(),
        EventKind::PatientRegistered,
        Payload::new(),
    );
    let err = log.append_event(mismatched).await.unwrap_err();

    assert!(matches!(err, EventStoreError::HandlerNotFound { .. }));
    assert_eq!(store.commits.load(Ordering::SeqCst), 0);
}
