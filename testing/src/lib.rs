//! # Chartlog Testing
//!
//! Testing utilities for the Chartlog event log.
//!
//! This crate provides:
//! - In-memory [`EventStore`](chartlog_core::event_store::EventStore) and
//!   [`AuditTrail`](chartlog_core::audit::AuditTrail) backends
//! - A fixed clock for deterministic timestamps
//! - Fixtures for building event logs and payloads
//!
//! ## Example
//!
//! ```
//! use chartlog_testing::fixtures;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let (log, _store) = fixtures::event_log();
//! let event = log
//!     .append("patient", "p1", "PatientRegistered", json!({"name": "Jo"}), None)
//!     .await
//!     .unwrap();
//! assert_eq!(event.sequence.value(), 1);
//! # });
//! ```

use chartlog_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod in_memory;

pub use in_memory::{InMemoryAuditTrail, InMemoryEventStore};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use chartlog_testing::mocks::FixedClock;
    /// use chartlog_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Builders for event logs and payloads used across test suites.
pub mod fixtures {
    use super::InMemoryEventStore;
    use super::mocks::test_clock;
    use chartlog_core::event::Payload;
    use chartlog_core::handler::Dispatcher;
    use chartlog_runtime::{EventLog, EventLogConfig};
    use serde_json::Value;
    use std::sync::Arc;

    /// Event log over a fresh in-memory store with the standard handlers,
    /// the fixed test clock and default configuration.
    #[must_use]
    pub fn event_log() -> (EventLog, InMemoryEventStore) {
        event_log_with(Dispatcher::standard(), EventLogConfig::default())
    }

    /// Event log over a fresh in-memory store with custom handlers and config.
    #[must_use]
    pub fn event_log_with(
        dispatcher: Dispatcher,
        config: EventLogConfig,
    ) -> (EventLog, InMemoryEventStore) {
        let store = InMemoryEventStore::new();
        let log = EventLog::new(Arc::new(store.clone()), Arc::new(dispatcher))
            .with_clock(Arc::new(test_clock()))
            .with_config(config);
        (log, store)
    }

    /// The object inside `value`, or an empty payload for anything else.
    #[must_use]
    pub fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
