//! Event store trait and the error taxonomy of the event log.
//!
//! An event store persists [`EventRecord`]s per aggregate with a uniqueness
//! guard on `(aggregate_type, aggregate_id, sequence)` and commits each event
//! together with its read-model projection.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `chartlog-postgres`): production implementation
//! - `InMemoryEventStore` (in `chartlog-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use chartlog_core::event_store::{EventStore, EventStoreError};
//! use chartlog_core::event::AggregateType;
//! use chartlog_core::stream::{AggregateId, Sequence};
//!
//! async fn next_sequence<S: EventStore>(store: &S) -> Result<Sequence, EventStoreError> {
//!     let id = AggregateId::new_unchecked("p1");
//!     let current = store.current_sequence(AggregateType::Patient, id).await?;
//!     Ok(Sequence::after(current))
//! }
//! ```

use crate::event::{AggregateType, EventKind, EventRecord};
use crate::handler::Dispatcher;
use crate::projection::{ProjectionError, ReadModel};
use crate::stream::{AggregateId, Sequence};
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by the dyn-compatible store traits.
pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, EventStoreError>>;

/// Errors surfaced by the event log.
///
/// `ValidationError`, `SequenceConflict`, `HandlerNotFound` and
/// `ProjectionFailure` are the four outcomes callers are expected to handle;
/// the remaining variants describe replay and infrastructure failures.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Malformed identifier, missing field, or non-consecutive sequence.
    #[error("Validation error on {field}: {message}")]
    ValidationError {
        /// The offending input field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// A concurrent writer already claimed this sequence.
    ///
    /// Retryable: re-read the current sequence and append again.
    #[error("Sequence conflict: {aggregate_type}/{aggregate_id} sequence {sequence} already claimed")]
    SequenceConflict {
        /// Aggregate type of the contended stream.
        aggregate_type: AggregateType,
        /// Aggregate id of the contended stream.
        aggregate_id: AggregateId,
        /// The sequence that lost the race.
        sequence: Sequence,
    },

    /// No projection handler is registered for this aggregate/event pair.
    #[error("No handler registered for {aggregate_type} event {event_type}")]
    HandlerNotFound {
        /// Aggregate type as supplied by the caller.
        aggregate_type: String,
        /// Event type as supplied by the caller.
        event_type: String,
    },

    /// The handler failed while applying the event; nothing was committed.
    #[error("Projection of {event_type} failed: {source}")]
    ProjectionFailure {
        /// Event being projected.
        event_type: EventKind,
        /// Why the projection failed.
        #[source]
        source: ProjectionError,
    },

    /// A stored event could not be folded into state.
    #[error("Replay failed at sequence {sequence}: {reason}")]
    ReplayFailed {
        /// Sequence of the offending event (0 when the history itself is malformed).
        sequence: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// Replayed state and materialised read model disagree.
    #[error("Read model for {aggregate_id} diverges from its event history")]
    ProjectionDrift {
        /// The inconsistent aggregate.
        aggregate_id: AggregateId,
    },

    /// The append did not finish in time and was rolled back.
    #[error("Append timed out after {0:?}")]
    Timeout(Duration),

    /// Database connection or query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Stored data could not be (de)serialised.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// How the boundary layer should present an error to a user.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Ask the user to retry.
    Retry,
    /// Report against an input field.
    Field,
    /// Generic failure.
    Failure,
}

impl EventStoreError {
    /// Build a validation error for `field`.
    #[must_use]
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field,
            message: message.into(),
        }
    }

    /// Whether retrying the same append can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::SequenceConflict { .. })
    }

    /// Boundary mapping: conflicts retry, validation errors are field-level.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::SequenceConflict { .. } => ErrorCategory::Retry,
            Self::ValidationError { .. } => ErrorCategory::Field,
            _ => ErrorCategory::Failure,
        }
    }

    /// Short stable label, used for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "validation",
            Self::SequenceConflict { .. } => "sequence_conflict",
            Self::HandlerNotFound { .. } => "handler_not_found",
            Self::ProjectionFailure { .. } => "projection_failure",
            Self::ReplayFailed { .. } => "replay_failed",
            Self::ProjectionDrift { .. } => "projection_drift",
            Self::Timeout(_) => "timeout",
            Self::DatabaseError(_) => "database",
            Self::SerializationError(_) => "serialization",
        }
    }
}

/// Storage backend for the event log.
///
/// # Transactions
///
/// [`EventStore::commit`] is the only write. It must, atomically:
///
/// 1. reject the event if its aggregate id is owned by another aggregate type
///    (`ValidationError`)
/// 2. insert it under the `(aggregate_type, aggregate_id, sequence)` uniqueness
///    guard, mapping a violation to `SequenceConflict`
/// 3. run `dispatcher` against a [`ReadModelTx`](crate::projection::ReadModelTx)
///    bound to the same transaction
///
/// If any step fails, or the returned future is dropped before completion,
/// neither the event nor any projection write may become visible.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Highest committed sequence for the stream, `None` when it has no events.
    ///
    /// # Errors
    ///
    /// `DatabaseError` when the store cannot be read.
    fn current_sequence(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> StoreFuture<'_, Option<Sequence>>;

    /// Insert `event` and project it, in one transaction.
    ///
    /// # Errors
    ///
    /// `SequenceConflict`, `ValidationError`, `HandlerNotFound`,
    /// `ProjectionFailure`, or infrastructure errors.
    fn commit<'a>(
        &'a self,
        event: EventRecord,
        dispatcher: &'a Dispatcher,
    ) -> StoreFuture<'a, EventRecord>;

    /// Every committed event of the aggregate, ascending by sequence.
    ///
    /// Unknown aggregates yield an empty vector.
    ///
    /// # Errors
    ///
    /// `DatabaseError` or `SerializationError`.
    fn load_events(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Vec<EventRecord>>;

    /// The materialised read model of the aggregate, if any.
    ///
    /// # Errors
    ///
    /// `DatabaseError` or `SerializationError`.
    fn load_read_model(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Option<ReadModel>>;
}
