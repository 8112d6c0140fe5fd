//! # Chartlog Runtime
//!
//! The in-process API of the event log: [`EventLog`].
//!
//! An append runs, inside one timeout:
//!
//! 1. resolve the projection handler for `(aggregate_type, event_type)`
//! 2. read the stream's current sequence and claim the next one
//! 3. commit the event and its projection in one store transaction
//! 4. on `SequenceConflict`, back off and go to 2 (bounded by [`RetryPolicy`])
//!
//! # Example
//!
//! ```ignore
//! use chartlog_core::handler::Dispatcher;
//! use chartlog_runtime::EventLog;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let log = EventLog::new(store, Arc::new(Dispatcher::standard()));
//! let event = log
//!     .append("patient", "p1", "PatientRegistered", json!({"name": "Jo"}), None)
//!     .await?;
//! assert_eq!(event.sequence.value(), 1);
//! ```

use chartlog_core::environment::{Clock, SystemClock};
use chartlog_core::event::{EventKind, EventRecord, NewEvent, Payload};
use chartlog_core::event_store::{EventStore, EventStoreError};
use chartlog_core::handler::Dispatcher;
use chartlog_core::projection::ReadModel;
use chartlog_core::replay::{self, AggregateState};
use chartlog_core::sequence::{PendingAppend, SequenceAllocator};
use chartlog_core::stream::AggregateId;
use chrono::SubsecRound;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

pub mod config;
pub mod metrics;
pub mod retry;

pub use config::{ConfigError, EventLogConfig};
pub use retry::RetryPolicy;

use metrics::EventLogMetrics;

/// Event log API consumed by the web layer.
///
/// Cheap to clone; clones share the store, dispatcher and clock.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: EventLogConfig,
}

impl EventLog {
    /// Event log over `store`, with default configuration and the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
            config: EventLogConfig::default(),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EventLogConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the clock used to timestamp events.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// The dispatcher shared with the store.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Append from untyped boundary input.
    ///
    /// `event_data` must be a JSON object; `metadata` must be an object or
    /// absent.
    ///
    /// # Errors
    ///
    /// - `ValidationError` for an empty event type, a malformed aggregate id,
    ///   or non-object payload/metadata
    /// - `HandlerNotFound` for unknown or unhandled type names
    /// - everything [`EventLog::append_event`] returns
    pub async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        event_data: Value,
        metadata: Option<Value>,
    ) -> Result<EventRecord, EventStoreError> {
        let result = self
            .parse_append(aggregate_type, aggregate_id, event_type, event_data, metadata);
        match result {
            Ok(event) => self.append_event(event).await,
            Err(error) => {
                tracing::warn!(
                    aggregate_type,
                    aggregate_id,
                    event_type,
                    error = %error,
                    "Append rejected"
                );
                EventLogMetrics::record_rejection(&error);
                Err(error)
            },
        }
    }

    fn parse_append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        event_data: Value,
        metadata: Option<Value>,
    ) -> Result<NewEvent, EventStoreError> {
        let (aggregate_type, kind) = self.dispatcher.resolve_names(aggregate_type, event_type)?;
        let aggregate_id = parse_aggregate_id(aggregate_id)?;
        let Value::Object(payload) = event_data else {
            return Err(EventStoreError::validation(
                "event_data",
                "event data must be a JSON object",
            ));
        };
        let metadata = match metadata {
            None | Some(Value::Null) => Payload::new(),
            Some(Value::Object(metadata)) => metadata,
            Some(_) => {
                return Err(EventStoreError::validation(
                    "metadata",
                    "metadata must be a JSON object",
                ));
            },
        };
        Ok(NewEvent::new(aggregate_type, aggregate_id, kind, payload).with_metadata(metadata))
    }

    /// Append a typed event, retrying lost sequence races.
    ///
    /// Events with an explicit `expected_sequence` get exactly one attempt.
    ///
    /// # Errors
    ///
    /// - `HandlerNotFound` when no handler is registered for the event
    /// - `ValidationError` for a non-consecutive explicit sequence or an
    ///   aggregate id owned by another type
    /// - `SequenceConflict` once retries are exhausted
    /// - `ProjectionFailure` when the handler fails; nothing is stored
    /// - `Timeout` when the append outlives `append_timeout`; nothing is stored
    pub async fn append_event(&self, event: NewEvent) -> Result<EventRecord, EventStoreError> {
        let started = Instant::now();
        let timeout = self.config.append_timeout;
        let aggregate_type = event.aggregate_type;
        let kind = event.kind;

        let attempts = async {
            self.dispatcher.resolve(aggregate_type, kind)?;
            if event.expected_sequence.is_some() {
                self.try_append(&event).await
            } else {
                retry::retry_with_predicate(
                    &self.config.retry,
                    || self.try_append(&event),
                    EventStoreError::is_retryable,
                )
                .await
            }
        };

        let result = match tokio::time::timeout(timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(EventStoreError::Timeout(timeout)),
        };

        match &result {
            Ok(record) => {
                EventLogMetrics::record_append(aggregate_type, kind, started.elapsed());
                tracing::info!(
                    aggregate_type = %record.aggregate_type,
                    aggregate_id = %record.aggregate_id,
                    event_type = %record.event_type,
                    sequence = record.sequence.value(),
                    "Event appended"
                );
            },
            Err(error) => {
                EventLogMetrics::record_rejection(error);
                match error {
                    EventStoreError::ProjectionFailure { .. }
                    | EventStoreError::SequenceConflict { .. }
                    | EventStoreError::Timeout(_) => tracing::error!(
                        aggregate_type = %aggregate_type,
                        aggregate_id = %event.aggregate_id,
                        event_type = %kind,
                        error = %error,
                        "Append failed"
                    ),
                    _ => tracing::warn!(
                        aggregate_type = %aggregate_type,
                        aggregate_id = %event.aggregate_id,
                        event_type = %kind,
                        error = %error,
                        "Append rejected"
                    ),
                }
            },
        }
        result
    }

    /// One optimistic attempt: [`EventLog::reserve`] then [`EventLog::commit`].
    ///
    /// # Errors
    ///
    /// As [`EventLog::append_event`], but `SequenceConflict` is returned
    /// without retrying and no timeout is applied.
    pub async fn try_append(&self, event: &NewEvent) -> Result<EventRecord, EventStoreError> {
        let pending = self.reserve(event.clone()).await?;
        self.commit(pending).await
    }

    /// Read the stream's current sequence and claim the next one.
    ///
    /// Nothing is written; the claim is only checked when committed.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound`, `ValidationError` for a non-consecutive explicit
    /// sequence, or store errors.
    pub async fn reserve(&self, event: NewEvent) -> Result<PendingAppend, EventStoreError> {
        self.dispatcher.resolve(event.aggregate_type, event.kind)?;
        let current = self
            .store
            .current_sequence(event.aggregate_type, event.aggregate_id.clone())
            .await?;
        SequenceAllocator::reserve(event, current)
    }

    /// Commit a reserved append.
    ///
    /// # Errors
    ///
    /// `SequenceConflict` when another writer committed the claimed sequence
    /// first, plus whatever the store's commit returns.
    pub async fn commit(&self, pending: PendingAppend) -> Result<EventRecord, EventStoreError> {
        let PendingAppend { event, sequence } = pending;
        let aggregate_type = event.aggregate_type;
        let record = event.into_record(sequence, self.clock.now().trunc_subsecs(6));

        let result = self.store.commit(record, &self.dispatcher).await;
        if let Err(EventStoreError::SequenceConflict { aggregate_id, sequence, .. }) = &result {
            EventLogMetrics::record_conflict(aggregate_type);
            tracing::warn!(
                aggregate_type = %aggregate_type,
                aggregate_id = %aggregate_id,
                sequence = sequence.value(),
                "Sequence already claimed by a concurrent writer"
            );
        }
        result
    }

    /// Every event of the aggregate, ascending by sequence, optionally
    /// filtered by event type.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a malformed id or an unknown filter type, or
    /// store errors.
    pub async fn get_events(
        &self,
        aggregate_id: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let aggregate_id = parse_aggregate_id(aggregate_id)?;
        let filter = event_type
            .map(|name| {
                name.parse::<EventKind>()
                    .map_err(|e| EventStoreError::validation("event_type", e.to_string()))
            })
            .transpose()?;

        let mut events = self.store.load_events(aggregate_id.clone()).await?;
        if let Some(kind) = filter {
            events.retain(|event| event.event_type == kind);
        }
        tracing::debug!(aggregate_id = %aggregate_id, count = events.len(), "Events loaded");
        Ok(events)
    }

    /// Fold the aggregate's history into state.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a malformed id, `ReplayFailed` for a history that
    /// cannot be folded, or store errors.
    pub async fn replay(&self, aggregate_id: &str) -> Result<Option<AggregateState>, EventStoreError> {
        let aggregate_id = parse_aggregate_id(aggregate_id)?;
        let events = self.store.load_events(aggregate_id.clone()).await?;
        let result = replay::fold(&events);
        EventLogMetrics::record_replay(result.is_ok());
        if let Err(error) = &result {
            tracing::error!(aggregate_id = %aggregate_id, error = %error, "Replay failed");
        }
        result
    }

    /// Current state of the aggregate, reconstructed from its history.
    ///
    /// `None` when the aggregate has no events.
    ///
    /// # Errors
    ///
    /// As [`EventLog::replay`].
    pub async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Payload>, EventStoreError> {
        Ok(self
            .replay(aggregate_id)
            .await?
            .map(|state| state.to_snapshot()))
    }

    /// The materialised read model of the aggregate.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a malformed id, or store errors.
    pub async fn get_read_model(&self, aggregate_id: &str) -> Result<Option<ReadModel>, EventStoreError> {
        let aggregate_id = parse_aggregate_id(aggregate_id)?;
        self.store.load_read_model(aggregate_id).await
    }

    /// Check that folding the history reproduces the materialised read model.
    ///
    /// # Errors
    ///
    /// `ProjectionDrift` when they disagree, plus whatever the reads return.
    pub async fn verify_projection(&self, aggregate_id: &str) -> Result<(), EventStoreError> {
        let folded = self.get_snapshot(aggregate_id).await?;
        let materialised = self
            .get_read_model(aggregate_id)
            .await?
            .map(|model| model.to_snapshot());

        if folded == materialised {
            Ok(())
        } else {
            tracing::error!(aggregate_id, "Read model diverges from event history");
            Err(EventStoreError::ProjectionDrift {
                aggregate_id: AggregateId::new_unchecked(aggregate_id),
            })
        }
    }
}

fn parse_aggregate_id(raw: &str) -> Result<AggregateId, EventStoreError> {
    AggregateId::parse(raw).map_err(|e| EventStoreError::validation("aggregate_id", e.reason()))
}
