//! Read models and the projections that keep them current.
//!
//! # Overview
//!
//! Every committed event is projected, inside the append's transaction, into
//! one of four denormalised read-model families:
//!
//! | aggregate   | read model              | keyed by                |
//! |-------------|-------------------------|-------------------------|
//! | `Patient`   | [`PatientView`]         | aggregate id            |
//! | `Clinical`  | [`ClinicalEntry`] rows  | event id (one per event)|
//! | `Lab`       | [`LabView`]             | lab result id           |
//! | `Security`  | [`AccessLogEntry`] rows | event id (one per event)|
//!
//! Each family exposes a pure `apply` function holding its merge semantics,
//! and a `project` handler that runs `apply` against a [`ReadModelTx`]. The
//! replay engine calls the same `apply` functions, so a fold of the history
//! and the materialised view are computed by one piece of code.

pub mod clinical;
pub mod lab;
pub mod patient;
pub mod security;

pub use clinical::{ClinicalEntry, ClinicalRecord, ProviderDetails, SymptomsSummary};
pub use lab::LabView;
pub use patient::{PatientStatus, PatientView};
pub use security::{AccessLog, AccessLogEntry};

use crate::event::{AggregateType, EventKind, EventRecord, Payload};
use crate::stream::AggregateId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// A required payload field is absent.
    #[error("{event_type} payload is missing `{field}`")]
    MissingField {
        /// Event being projected.
        event_type: EventKind,
        /// The missing field.
        field: &'static str,
    },

    /// A payload field has the wrong shape.
    #[error("{event_type} payload field `{field}` is invalid: {message}")]
    InvalidField {
        /// Event being projected.
        event_type: EventKind,
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// The row the event applies to does not exist.
    #[error("{event_type} targets missing read-model row {row}")]
    RowNotFound {
        /// Event being projected.
        event_type: EventKind,
        /// Key of the missing row.
        row: String,
    },

    /// The event would create a row that already exists.
    #[error("{event_type} would recreate existing read-model row {row}")]
    RowExists {
        /// Event being projected.
        event_type: EventKind,
        /// Key of the existing row.
        row: String,
    },

    /// The event targets a row owned by another aggregate.
    #[error("{event_type} on {aggregate_id} targets row {row} of another aggregate")]
    ForeignRow {
        /// Event being projected.
        event_type: EventKind,
        /// Aggregate the event belongs to.
        aggregate_id: AggregateId,
        /// Row the payload pointed at.
        row: String,
    },

    /// This projection does not handle the event.
    #[error("{aggregate_type} projection does not handle {event_type}")]
    UnsupportedEvent {
        /// Projection family.
        aggregate_type: AggregateType,
        /// Event that reached it.
        event_type: EventKind,
    },

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Boxed future returned by [`ReadModelTx`] methods.
pub type TxFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Field-level merge of a partial document into a versioned one.
///
/// `merge` is total: every field present in the patch overwrites the
/// corresponding field, absent fields are left alone, and the version is
/// bumped once per merge.
pub trait Merge {
    /// The partial document merged in.
    type Patch;

    /// Overwrite every field the patch carries.
    fn merge(&mut self, patch: Self::Patch);
}

/// Materialised state of one aggregate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReadModel {
    /// Current patient row.
    Patient(PatientView),
    /// Every clinical entry of the episode, by sequence.
    Clinical(ClinicalRecord),
    /// Current lab result row.
    Lab(LabView),
    /// Every access-log entry of the principal, by sequence.
    Security(AccessLog),
}

impl ReadModel {
    /// Aggregate type of this read model.
    #[must_use]
    pub const fn aggregate_type(&self) -> AggregateType {
        match self {
            Self::Patient(_) => AggregateType::Patient,
            Self::Clinical(_) => AggregateType::Clinical,
            Self::Lab(_) => AggregateType::Lab,
            Self::Security(_) => AggregateType::Security,
        }
    }

    /// Aggregate this read model belongs to.
    #[must_use]
    pub const fn aggregate_id(&self) -> &AggregateId {
        match self {
            Self::Patient(view) => &view.aggregate_id,
            Self::Clinical(record) => &record.aggregate_id,
            Self::Lab(view) => &view.aggregate_id,
            Self::Security(log) => &log.aggregate_id,
        }
    }

    /// Apply one event on top of `current`, as the handler for it would.
    ///
    /// # Errors
    ///
    /// Whatever the family's `apply` rejects, or `UnsupportedEvent` when
    /// `current` belongs to a different family than the event.
    pub fn apply(current: Option<Self>, event: &EventRecord) -> Result<Self> {
        let mismatch = || ProjectionError::UnsupportedEvent {
            aggregate_type: event.aggregate_type,
            event_type: event.event_type,
        };
        match (event.aggregate_type, current) {
            (AggregateType::Patient, None) => Ok(Self::Patient(patient::apply(None, event)?)),
            (AggregateType::Patient, Some(Self::Patient(view))) => {
                Ok(Self::Patient(patient::apply(Some(view), event)?))
            },
            (AggregateType::Clinical, current) => {
                let mut record = match current {
                    None => ClinicalRecord::new(event.aggregate_id.clone()),
                    Some(Self::Clinical(record)) => record,
                    Some(_) => return Err(mismatch()),
                };
                let entry = clinical::apply(record.entries.last(), event)?;
                record.entries.push(entry);
                Ok(Self::Clinical(record))
            },
            (AggregateType::Lab, None) => Ok(Self::Lab(lab::apply(None, event)?)),
            (AggregateType::Lab, Some(Self::Lab(view))) => Ok(Self::Lab(lab::apply(Some(view), event)?)),
            (AggregateType::Security, current) => {
                let mut log = match current {
                    None => AccessLog::new(event.aggregate_id.clone()),
                    Some(Self::Security(log)) => log,
                    Some(_) => return Err(mismatch()),
                };
                log.entries.push(security::apply(event)?);
                Ok(Self::Security(log))
            },
            (_, Some(_)) => Err(mismatch()),
        }
    }

    /// Flatten into the map returned by `get_snapshot`.
    #[must_use]
    pub fn to_snapshot(&self) -> Payload {
        match self {
            Self::Patient(view) => view.to_snapshot(),
            Self::Clinical(record) => record.to_snapshot(),
            Self::Lab(view) => view.to_snapshot(),
            Self::Security(log) => log.to_snapshot(),
        }
    }
}

/// Read-model access bound to an open append transaction.
///
/// Handlers receive a `&mut dyn ReadModelTx`; everything written through it
/// commits or rolls back together with the event being appended.
/// `load_patient` and `load_lab` lock the row they return until the
/// transaction ends.
pub trait ReadModelTx: Send {
    /// Current patient row, locked for update.
    fn load_patient(&mut self, aggregate_id: AggregateId) -> TxFuture<'_, Option<PatientView>>;

    /// Insert or replace a patient row.
    fn save_patient(&mut self, view: PatientView) -> TxFuture<'_, ()>;

    /// Most recent clinical entry of the episode.
    fn last_clinical_entry(
        &mut self,
        aggregate_id: AggregateId,
    ) -> TxFuture<'_, Option<ClinicalEntry>>;

    /// Insert a new immutable clinical entry.
    fn insert_clinical_entry(&mut self, entry: ClinicalEntry) -> TxFuture<'_, ()>;

    /// Lab result row by its own id, locked for update.
    fn load_lab(&mut self, result_id: AggregateId) -> TxFuture<'_, Option<LabView>>;

    /// Insert or replace a lab result row.
    fn save_lab(&mut self, view: LabView) -> TxFuture<'_, ()>;

    /// Insert a new immutable access-log entry.
    fn insert_access_entry(&mut self, entry: AccessLogEntry) -> TxFuture<'_, ()>;
}

/// Required JSON object field of the event payload.
pub(crate) fn object_field<'a>(event: &'a EventRecord, field: &'static str) -> Result<&'a Payload> {
    match event.field(field) {
        None | Some(Value::Null) => Err(ProjectionError::MissingField {
            event_type: event.event_type,
            field,
        }),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(ProjectionError::InvalidField {
            event_type: event.event_type,
            field,
            message: format!("expected an object, found {}", type_name(other)),
        }),
    }
}

/// Optional string field of the event payload.
pub(crate) fn optional_string(event: &EventRecord, field: &'static str) -> Result<Option<String>> {
    match event.field(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(ProjectionError::InvalidField {
            event_type: event.event_type,
            field,
            message: format!("expected a string, found {}", type_name(other)),
        }),
    }
}

/// Overwrite every key of `target` that `patch` carries.
pub(crate) fn merge_fields(target: &mut Payload, patch: &Payload) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use crate::stream::Sequence;
    use chrono::Utc;
    use serde_json::json;

    fn event(kind: EventKind, id: &str, payload: Value) -> EventRecord {
        NewEvent::new(
            kind.aggregate_type(),
            AggregateId::new_unchecked(id),
            kind,
            payload.as_object().cloned().unwrap(),
        )
        .into_record(Sequence::FIRST, Utc::now())
    }

    #[test]
    fn object_field_distinguishes_missing_and_invalid() {
        let e = event(EventKind::PatientUpdated, "p1", json!({"updates": "nope"}));
        assert!(matches!(
            object_field(&e, "updates"),
            Err(ProjectionError::InvalidField { field: "updates", .. })
        ));
        assert!(matches!(
            object_field(&e, "other"),
            Err(ProjectionError::MissingField { field: "other", .. })
        ));
    }

    #[test]
    fn merge_fields_overwrites_per_key() {
        let mut target = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let patch = json!({"b": 3, "c": 4}).as_object().cloned().unwrap();
        merge_fields(&mut target, &patch);
        assert_eq!(Value::Object(target), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn apply_rejects_family_mismatch() {
        let registered = event(EventKind::PatientRegistered, "p1", json!({"name": "Jo"}));
        let patient = ReadModel::apply(None, &registered).unwrap();

        let lab = event(EventKind::LabResultRecorded, "p1", json!({"results": {}}));
        let err = ReadModel::apply(Some(patient), &lab).unwrap_err();
        assert!(matches!(err, ProjectionError::UnsupportedEvent { .. }));
    }

    #[test]
    fn read_model_reports_its_aggregate() {
        let registered = event(EventKind::PatientRegistered, "p7", json!({}));
        let model = ReadModel::apply(None, &registered).unwrap();
        assert_eq!(model.aggregate_type(), AggregateType::Patient);
        assert_eq!(model.aggregate_id().as_str(), "p7");
    }
}
