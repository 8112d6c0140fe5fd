//! Handler registry and dispatcher.
//!
//! Projection handlers are plain function pointers indexed by
//! `(AggregateType, EventKind)`. The registry is assembled once at start-up,
//! owned by a [`Dispatcher`], and passed explicitly (usually behind an `Arc`)
//! to every store and call site.
//!
//! # Example
//!
//! ```
//! use chartlog_core::event::{AggregateType, EventKind};
//! use chartlog_core::handler::Dispatcher;
//!
//! let dispatcher = Dispatcher::standard();
//! let handler = dispatcher
//!     .resolve(AggregateType::Patient, EventKind::PatientRegistered)
//!     .unwrap();
//! assert_eq!(handler.name, "patient.registered");
//!
//! assert!(dispatcher.resolve(AggregateType::Patient, EventKind::VitalsRecorded).is_err());
//! ```

use crate::event::{AggregateType, EventKind, EventRecord};
use crate::event_store::EventStoreError;
use crate::projection::{ReadModelTx, TxFuture, clinical, lab, patient, security};
use std::collections::HashMap;
use std::fmt;

/// Signature of a projection handler.
///
/// The handler receives the event being appended and the read-model access of
/// the append's open transaction.
pub type HandlerFn = for<'a> fn(&'a EventRecord, &'a mut dyn ReadModelTx) -> TxFuture<'a, ()>;

/// A named projection handler.
#[derive(Clone, Copy)]
pub struct Handler {
    /// Stable name, used in logs.
    pub name: &'static str,
    /// The projection function.
    pub run: HandlerFn,
}

// Manual Debug implementation since function pointers print as addresses
impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Fixed table of projection handlers.
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(AggregateType, EventKind), Handler>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `run` for `(aggregate_type, kind)`, replacing any previous entry.
    #[must_use]
    pub fn with(
        mut self,
        aggregate_type: AggregateType,
        kind: EventKind,
        name: &'static str,
        run: HandlerFn,
    ) -> Self {
        self.handlers.insert((aggregate_type, kind), Handler { name, run });
        self
    }

    /// The four projection families wired to every event kind they handle.
    #[must_use]
    pub fn standard() -> Self {
        use AggregateType::{Clinical, Lab, Patient, Security};
        use EventKind as K;

        Self::new()
            .with(Patient, K::PatientRegistered, "patient.registered", patient::project)
            .with(Patient, K::PatientUpdated, "patient.updated", patient::project)
            .with(Patient, K::PatientArchived, "patient.archived", patient::project)
            .with(Clinical, K::VitalsRecorded, "clinical.vitals", clinical::project)
            .with(Clinical, K::DiagnosisAdded, "clinical.diagnosis", clinical::project)
            .with(Clinical, K::SymptomsAdded, "clinical.symptoms", clinical::project)
            .with(Clinical, K::SymptomsUpdated, "clinical.symptoms", clinical::project)
            .with(Clinical, K::MedicationPrescribed, "clinical.medication", clinical::project)
            .with(Clinical, K::MedicationDiscontinued, "clinical.medication", clinical::project)
            .with(Lab, K::LabResultRecorded, "lab.recorded", lab::project)
            .with(Lab, K::LabResultUpdated, "lab.updated", lab::project)
            .with(Lab, K::LabResultCancelled, "lab.cancelled", lab::project)
            .with(Security, K::AccessGranted, "security.access", security::project)
            .with(Security, K::AccessRevoked, "security.access", security::project)
            .with(Security, K::AccessDenied, "security.access", security::project)
    }

    /// Handler for the pair, if registered.
    #[must_use]
    pub fn get(&self, aggregate_type: AggregateType, kind: EventKind) -> Option<&Handler> {
        self.handlers.get(&(aggregate_type, kind))
    }

    /// Number of registered pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Routes committed events to their projection handler.
#[derive(Clone, Debug, Default)]
pub struct Dispatcher {
    registry: HandlerRegistry,
}

impl Dispatcher {
    /// Dispatcher over `registry`.
    #[must_use]
    pub const fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Dispatcher over [`HandlerRegistry::standard`].
    #[must_use]
    pub fn standard() -> Self {
        Self::new(HandlerRegistry::standard())
    }

    /// The underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Handler for the pair.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` when the pair is not registered.
    pub fn resolve(
        &self,
        aggregate_type: AggregateType,
        kind: EventKind,
    ) -> Result<&Handler, EventStoreError> {
        self.registry
            .get(aggregate_type, kind)
            .ok_or_else(|| EventStoreError::HandlerNotFound {
                aggregate_type: aggregate_type.to_string(),
                event_type: kind.to_string(),
            })
    }

    /// Parse caller-supplied type names and check a handler exists for them.
    ///
    /// Unknown aggregate types and unknown event types are rejected the same
    /// way, with `HandlerNotFound`.
    ///
    /// # Errors
    ///
    /// - `ValidationError` for an empty event type
    /// - `HandlerNotFound` for unknown names or an unregistered pair
    pub fn resolve_names(
        &self,
        aggregate_type: &str,
        event_type: &str,
    ) -> Result<(AggregateType, EventKind), EventStoreError> {
        if event_type.trim().is_empty() {
            return Err(EventStoreError::validation(
                "event_type",
                "event type cannot be empty",
            ));
        }
        let not_found = || EventStoreError::HandlerNotFound {
            aggregate_type: aggregate_type.to_string(),
            event_type: event_type.to_string(),
        };
        let parsed_type: AggregateType = aggregate_type.parse().map_err(|_| not_found())?;
        let kind: EventKind = event_type.parse().map_err(|_| not_found())?;
        self.registry
            .get(parsed_type, kind)
            .ok_or_else(not_found)?;
        Ok((parsed_type, kind))
    }

    /// Run the event's handler against the open transaction.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` when no handler is registered, `ProjectionFailure`
    /// wrapping whatever the handler returned.
    pub async fn dispatch(
        &self,
        event: &EventRecord,
        tx: &mut dyn ReadModelTx,
    ) -> Result<(), EventStoreError> {
        let handler = self.resolve(event.aggregate_type, event.event_type)?;
        (handler.run)(event, tx)
            .await
            .map_err(|source| EventStoreError::ProjectionFailure {
                event_type: event.event_type,
                source,
            })
    }
}
