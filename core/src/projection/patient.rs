//! Patient read model.
//!
//! `PatientRegistered` creates the row at version 1, `PatientUpdated` merges
//! its `updates` object into the row's data, and `PatientArchived` flips the
//! status. Every event bumps the version by one.
//!
//! Registering an existing patient merges the registration data into the
//! row, so a registration that lost a sequence race can be retried.

use super::{ProjectionError, ReadModelTx, Result, TxFuture, merge_fields, object_field, optional_string};
use crate::event::{AggregateType, EventKind, EventRecord, Payload};
use crate::stream::AggregateId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle flag of a patient row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatientStatus {
    /// Registered and current.
    Active,
    /// Archived; the row is kept.
    Archived,
}

impl PatientStatus {
    /// Storage name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

/// Denormalised current state of one patient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatientView {
    /// Patient aggregate id.
    pub aggregate_id: AggregateId,
    /// Demographics and other registration data, with updates merged in.
    pub data: Payload,
    /// Active or archived.
    pub status: PatientStatus,
    /// Reason given when the patient was archived.
    pub archive_reason: Option<String>,
    /// Number of patient events applied to this row.
    pub version: u64,
    /// Timestamp of the registration event.
    pub registered_at: DateTime<Utc>,
    /// Timestamp of the latest event applied.
    pub updated_at: DateTime<Utc>,
    /// Id of the latest event applied.
    pub last_event_id: Uuid,
}

impl PatientView {
    /// Data fields plus `version`, and `status` once archived.
    #[must_use]
    pub fn to_snapshot(&self) -> Payload {
        let mut snapshot = self.data.clone();
        snapshot.insert("version".to_string(), Value::from(self.version));
        if self.status == PatientStatus::Archived {
            snapshot.insert(
                "status".to_string(),
                Value::from(PatientStatus::Archived.as_str()),
            );
        }
        snapshot
    }
}

/// Apply a patient event to the current row.
///
/// # Errors
///
/// - `RowNotFound` when updating or archiving an unknown patient
/// - `MissingField`/`InvalidField` for a malformed payload
/// - `UnsupportedEvent` for non-patient events
pub fn apply(current: Option<PatientView>, event: &EventRecord) -> Result<PatientView> {
    match (event.event_type, current) {
        (EventKind::PatientRegistered, None) => Ok(PatientView {
            aggregate_id: event.aggregate_id.clone(),
            data: event.event_data.clone(),
            status: PatientStatus::Active,
            archive_reason: None,
            version: 1,
            registered_at: event.timestamp,
            updated_at: event.timestamp,
            last_event_id: event.id,
        }),
        (EventKind::PatientRegistered, Some(mut view)) => {
            merge_fields(&mut view.data, &event.event_data);
            Ok(touch(view, event))
        },
        (EventKind::PatientUpdated, Some(mut view)) => {
            let updates = object_field(event, "updates")?;
            merge_fields(&mut view.data, updates);
            Ok(touch(view, event))
        },
        (EventKind::PatientArchived, Some(mut view)) => {
            view.archive_reason = optional_string(event, "reason")?;
            view.status = PatientStatus::Archived;
            Ok(touch(view, event))
        },
        (EventKind::PatientUpdated | EventKind::PatientArchived, None) => {
            Err(ProjectionError::RowNotFound {
                event_type: event.event_type,
                row: event.aggregate_id.to_string(),
            })
        },
        (other, _) => Err(ProjectionError::UnsupportedEvent {
            aggregate_type: AggregateType::Patient,
            event_type: other,
        }),
    }
}

fn touch(mut view: PatientView, event: &EventRecord) -> PatientView {
    view.version += 1;
    view.updated_at = event.timestamp;
    view.last_event_id = event.id;
    view
}

/// Handler: lock the patient row, apply the event, write it back.
pub fn project<'a>(event: &'a EventRecord, tx: &'a mut dyn ReadModelTx) -> TxFuture<'a, ()> {
    Box::pin(async move {
        let current = tx.load_patient(event.aggregate_id.clone()).await?;
        let view = apply(current, event)?;
        tx.save_patient(view).await
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use crate::stream::Sequence;
    use serde_json::json;

    fn event(kind: EventKind, sequence: u64, payload: Value) -> EventRecord {
        NewEvent::new(
            AggregateType::Patient,
            AggregateId::new_unchecked("p1"),
            kind,
            payload.as_object().cloned().unwrap(),
        )
        .into_record(Sequence::new(sequence).unwrap(), Utc::now())
    }

    #[test]
    fn registration_creates_version_one() {
        let view = apply(None, &event(EventKind::PatientRegistered, 1, json!({"name": "Jo"}))).unwrap();
        assert_eq!(view.version, 1);
        assert_eq!(view.status, PatientStatus::Active);
        assert_eq!(view.data["name"], json!("Jo"));
    }

    #[test]
    fn update_merges_fields_and_bumps_version() {
        let registered = event(EventKind::PatientRegistered, 1, json!({"name": "Jo", "dob": "1990-01-01"}));
        let updated = event(EventKind::PatientUpdated, 2, json!({"updates": {"name": "Joanna"}}));

        let view = apply(None, &registered).unwrap();
        let view = apply(Some(view), &updated).unwrap();

        assert_eq!(view.version, 2);
        assert_eq!(view.data["name"], json!("Joanna"));
        assert_eq!(view.data["dob"], json!("1990-01-01"));
        assert_eq!(view.last_event_id, updated.id);
        assert_eq!(
            Value::Object(view.to_snapshot()),
            json!({"name": "Joanna", "dob": "1990-01-01", "version": 2})
        );
    }

    #[test]
    fn archive_sets_status_and_reason() {
        let view = apply(None, &event(EventKind::PatientRegistered, 1, json!({"name": "Jo"}))).unwrap();
        let view = apply(
            Some(view),
            &event(EventKind::PatientArchived, 2, json!({"reason": "duplicate record"})),
        )
        .unwrap();

        assert_eq!(view.status, PatientStatus::Archived);
        assert_eq!(view.archive_reason.as_deref(), Some("duplicate record"));
        assert_eq!(view.to_snapshot()["status"], json!("archived"));
    }

    #[test]
    fn update_requires_updates_object() {
        let view = apply(None, &event(EventKind::PatientRegistered, 1, json!({}))).unwrap();
        let err = apply(Some(view), &event(EventKind::PatientUpdated, 2, json!({"name": "x"}))).unwrap_err();
        assert!(matches!(err, ProjectionError::MissingField { field: "updates", .. }));
    }

    #[test]
    fn update_before_registration_is_rejected() {
        let err = apply(None, &event(EventKind::PatientUpdated, 1, json!({"updates": {}}))).unwrap_err();
        assert!(matches!(err, ProjectionError::RowNotFound { .. }));
    }

    #[test]
    fn second_registration_merges_into_the_row() {
        let view = apply(
            None,
            &event(EventKind::PatientRegistered, 1, json!({"name": "Ana", "dob": "1990-04-02"})),
        )
        .unwrap();
        let view = apply(
            Some(view),
            &event(EventKind::PatientRegistered, 2, json!({"name": "Ana Maria"})),
        )
        .unwrap();

        assert_eq!(view.version, 2);
        assert_eq!(view.status, PatientStatus::Active);
        assert_eq!(
            Value::Object(view.to_snapshot()),
            json!({"name": "Ana Maria", "dob": "1990-04-02", "version": 2})
        );
    }
}
