//! Replay engine: folds an event history into aggregate state.
//!
//! [`fold`] is pure. It applies the same merge functions the projection
//! handlers run, so `fold(history)` reproduces the materialised read model
//! without touching storage.
//!
//! # Example
//!
//! ```
//! use chartlog_core::replay::fold;
//!
//! assert!(fold(&[]).unwrap().is_none());
//! ```

use crate::event::{AggregateType, EventKind, EventRecord, Payload};
use crate::event_store::EventStoreError;
use crate::projection::ReadModel;
use crate::sequence::SequenceAllocator;
use crate::stream::{AggregateId, Sequence};
use serde::{Deserialize, Serialize};

/// Lifecycle of an aggregate, driven solely by event kinds.
///
/// ```text
/// NoEvents -> Active -> { Archived | Discontinued | Cancelled }
/// ```
///
/// `Archived` and `Cancelled` are terminal. `Discontinued` returns to
/// `Active` when a new medication is prescribed.
///
/// [`Lifecycle::transition`] looks at the event kind alone, so any
/// `MedicationDiscontinued` yields `Discontinued`. [`fold`] then keeps a
/// clinical episode `Active` while its record still lists an active
/// medication.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// No event has been committed.
    #[default]
    NoEvents,
    /// At least one event, no terminal status.
    Active,
    /// Patient archived.
    Archived,
    /// Medication discontinued.
    Discontinued,
    /// Lab result cancelled.
    Cancelled,
}

impl Lifecycle {
    /// State after an event of `kind`, ignoring what the event did to the
    /// read model.
    #[must_use]
    pub const fn transition(self, kind: EventKind) -> Self {
        match (self, kind) {
            (Self::Archived, _) => Self::Archived,
            (Self::Cancelled, _) => Self::Cancelled,
            (_, EventKind::PatientArchived) => Self::Archived,
            (_, EventKind::LabResultCancelled) => Self::Cancelled,
            (_, EventKind::MedicationDiscontinued) => Self::Discontinued,
            (Self::Discontinued, EventKind::MedicationPrescribed) | (Self::NoEvents, _) => {
                Self::Active
            },
            (state, _) => state,
        }
    }

    /// State once the read model an event produced is known.
    ///
    /// A clinical episode is only `Discontinued` when no medication is still
    /// active.
    #[must_use]
    pub fn settle(self, model: &ReadModel) -> Self {
        match (self, model) {
            (Self::Discontinued, ReadModel::Clinical(record))
                if !record.active_medications().is_empty() =>
            {
                Self::Active
            },
            (state, _) => state,
        }
    }

    /// Whether no further event can change the lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Cancelled)
    }
}

/// State reconstructed from an aggregate's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Aggregate type of the history.
    pub aggregate_type: AggregateType,
    /// Aggregate id of the history.
    pub aggregate_id: AggregateId,
    /// Lifecycle after the last event.
    pub lifecycle: Lifecycle,
    /// Sequence of the last event folded.
    pub last_sequence: Sequence,
    /// The read model the history produces.
    pub model: ReadModel,
}

impl AggregateState {
    /// The snapshot map returned by `get_snapshot`.
    #[must_use]
    pub fn to_snapshot(&self) -> Payload {
        self.model.to_snapshot()
    }
}

/// Fold an ordered history into state.
///
/// Returns `Ok(None)` for an empty history.
///
/// # Errors
///
/// `ReplayFailed` when the history mixes aggregates, is out of order or has
/// gaps, or contains an event its projection cannot apply.
pub fn fold(events: &[EventRecord]) -> Result<Option<AggregateState>, EventStoreError> {
    SequenceAllocator::verify_history(events)?;

    let mut state: Option<AggregateState> = None;
    for event in events {
        let (current, lifecycle) = match state.take() {
            Some(s) => (Some(s.model), s.lifecycle),
            None => (None, Lifecycle::NoEvents),
        };
        let model = ReadModel::apply(current, event).map_err(|e| EventStoreError::ReplayFailed {
            sequence: event.sequence.value(),
            reason: e.to_string(),
        })?;
        state = Some(AggregateState {
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id.clone(),
            lifecycle: lifecycle.transition(event.event_type).settle(&model),
            last_sequence: event.sequence,
            model,
        });
    }
    Ok(state)
}
