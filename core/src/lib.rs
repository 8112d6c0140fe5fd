//! # Chartlog Core
//!
//! Core types for an event-sourced clinical record: the append-only event
//! log, per-aggregate sequencing, read-model projections and replay.
//!
//! ## Core Concepts
//!
//! - **Event**: immutable fact about one aggregate, positioned by a gapless
//!   per-aggregate [`Sequence`](stream::Sequence)
//! - **Event Store**: backend that commits an event and its projection in one
//!   transaction ([`EventStore`](event_store::EventStore))
//! - **Dispatcher**: fixed table of projection handlers keyed by
//!   `(AggregateType, EventKind)` ([`Dispatcher`](handler::Dispatcher))
//! - **Read Model**: denormalised patient, clinical, lab and access-log views
//! - **Replay**: pure fold of a history into the same state the projections
//!   materialise ([`fold`](replay::fold))
//!
//! This crate performs no I/O. Storage backends live in `chartlog-postgres`
//! and `chartlog-testing`; the append API lives in `chartlog-runtime`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod audit;
pub mod event;
pub mod event_store;
pub mod handler;
pub mod projection;
pub mod replay;
pub mod sequence;
pub mod stream;

pub use event::{AggregateType, EventKind, EventRecord, NewEvent, Payload};
pub use event_store::{ErrorCategory, EventStore, EventStoreError};
pub use handler::{Dispatcher, HandlerRegistry};
pub use projection::ReadModel;
pub use replay::{AggregateState, Lifecycle, fold};
pub use sequence::{PendingAppend, SequenceAllocator};
pub use stream::{AggregateId, Sequence};

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Stores stamp committed events with `now()`; tests inject a fixed clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
