//! Lab result read model.
//!
//! Rows are keyed by the lab result's own id. An event may name it with a
//! `resultId` payload field; when absent the aggregate id is used. A result id
//! belonging to another aggregate is rejected, so a lab aggregate owns exactly
//! one row.

use super::{ProjectionError, ReadModelTx, Result, TxFuture, merge_fields, object_field, optional_string};
use crate::event::{AggregateType, EventKind, EventRecord, Payload};
use crate::stream::AggregateId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current state of one lab result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabView {
    /// Row key.
    pub result_id: AggregateId,
    /// Lab aggregate that owns the row.
    pub aggregate_id: AggregateId,
    /// Result values, with updates and cancellation status merged in.
    pub results: Payload,
    /// Number of lab events applied to this row.
    pub version: u64,
    /// Timestamp of the recording event.
    pub recorded_at: DateTime<Utc>,
    /// Timestamp of the latest event applied.
    pub updated_at: DateTime<Utc>,
}

impl LabView {
    /// Whether a `LabResultCancelled` event has been applied.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.results.get("status").and_then(Value::as_str) == Some("cancelled")
    }

    /// The results map.
    #[must_use]
    pub fn to_snapshot(&self) -> Payload {
        self.results.clone()
    }
}

/// Row key the event addresses.
///
/// # Errors
///
/// `InvalidField` for a malformed `resultId`, `ForeignRow` when it names a
/// row other than the aggregate's own.
pub fn target_row(event: &EventRecord) -> Result<AggregateId> {
    let Some(raw) = optional_string(event, "resultId")? else {
        return Ok(event.aggregate_id.clone());
    };
    let result_id = AggregateId::parse(&raw).map_err(|e| ProjectionError::InvalidField {
        event_type: event.event_type,
        field: "resultId",
        message: e.reason().to_string(),
    })?;
    if result_id == event.aggregate_id {
        Ok(result_id)
    } else {
        Err(ProjectionError::ForeignRow {
            event_type: event.event_type,
            aggregate_id: event.aggregate_id.clone(),
            row: result_id.into_inner(),
        })
    }
}

/// Apply a lab event to the row it targets.
///
/// # Errors
///
/// - `RowExists` when recording over an existing result
/// - `RowNotFound` when updating or cancelling an unknown result
/// - `MissingField`/`InvalidField`/`ForeignRow` for a malformed payload
/// - `UnsupportedEvent` for non-lab events
pub fn apply(current: Option<LabView>, event: &EventRecord) -> Result<LabView> {
    let row = target_row(event)?;
    match (event.event_type, current) {
        (EventKind::LabResultRecorded, None) => Ok(LabView {
            result_id: row,
            aggregate_id: event.aggregate_id.clone(),
            results: object_field(event, "results")?.clone(),
            version: 1,
            recorded_at: event.timestamp,
            updated_at: event.timestamp,
        }),
        (EventKind::LabResultRecorded, Some(_)) => Err(ProjectionError::RowExists {
            event_type: event.event_type,
            row: row.into_inner(),
        }),
        (EventKind::LabResultUpdated, Some(mut view)) => {
            let updates = object_field(event, "updates")?;
            merge_fields(&mut view.results, updates);
            Ok(touch(view, event))
        },
        (EventKind::LabResultCancelled, Some(mut view)) => {
            let reason = optional_string(event, "reason")?;
            view.results
                .insert("status".to_string(), Value::from("cancelled"));
            if let Some(reason) = reason {
                view.results
                    .insert("cancellationReason".to_string(), Value::from(reason));
            }
            Ok(touch(view, event))
        },
        (EventKind::LabResultUpdated | EventKind::LabResultCancelled, None) => {
            Err(ProjectionError::RowNotFound {
                event_type: event.event_type,
                row: row.into_inner(),
            })
        },
        (other, _) => Err(ProjectionError::UnsupportedEvent {
            aggregate_type: AggregateType::Lab,
            event_type: other,
        }),
    }
}

fn touch(mut view: LabView, event: &EventRecord) -> LabView {
    view.version += 1;
    view.updated_at = event.timestamp;
    view
}

/// Handler: lock the targeted result row, apply the event, write it back.
pub fn project<'a>(event: &'a EventRecord, tx: &'a mut dyn ReadModelTx) -> TxFuture<'a, ()> {
    Box::pin(async move {
        let row = target_row(event)?;
        let current = tx.load_lab(row).await?;
        let view = apply(current, event)?;
        tx.save_lab(view).await
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
            AggregateType::Lab,
            AggregateId::new_unchecked("lab-1"),
            kind,
            payload.as_object().cloned().unwrap(),
        )
        .into_record(Sequence::new(sequence).unwrap(), Utc::now())
    }

    #[test]
    fn update_merges_partial_results() {
        let recorded = event(EventKind::LabResultRecorded, 1, json!({"results": {"glucose": 100}}));
        let updated = event(
            EventKind::LabResultUpdated,
            2,
            json!({"updates": {"glucose": 110, "note": "recheck"}}),
        );

        let view = apply(None, &recorded).unwrap();
        let view = apply(Some(view), &updated).unwrap();

        assert_eq!(view.version, 2);
        assert_eq!(
            Value::Object(view.to_snapshot()),
            json!({"glucose": 110, "note": "recheck"})
        );
    }

    #[test]
    fn cancellation_is_recorded_inside_results() {
        let view = apply(
            None,
            &event(EventKind::LabResultRecorded, 1, json!({"results": {"hba1c": 5.4}})),
        )
        .unwrap();
        let view = apply(
            Some(view),
            &event(EventKind::LabResultCancelled, 2, json!({"reason": "haemolysed sample"})),
        )
        .unwrap();

        assert!(view.is_cancelled());
        assert_eq!(view.results["cancellationReason"], json!("haemolysed sample"));
        assert_eq!(view.results["hba1c"], json!(5.4));
    }

    #[test]
    fn explicit_result_id_must_match_aggregate() {
        let own = event(EventKind::LabResultRecorded, 1, json!({"resultId": "lab-1", "results": {}}));
        assert_eq!(target_row(&own).unwrap().as_str(), "lab-1");

        let foreign = event(EventKind::LabResultUpdated, 2, json!({"resultId": "lab-9", "updates": {}}));
        assert!(matches!(target_row(&foreign), Err(ProjectionError::ForeignRow { .. })));

        let malformed = event(EventKind::LabResultUpdated, 2, json!({"resultId": "", "updates": {}}));
        assert!(matches!(
            target_row(&malformed),
            Err(ProjectionError::InvalidField { field: "resultId", .. })
        ));
    }

    #[test]
    fn recording_requires_results() {
        let err = apply(None, &event(EventKind::LabResultRecorded, 1, json!({}))).unwrap_err();
        assert!(matches!(err, ProjectionError::MissingField { field: "results", .. }));
    }

    #[test]
    fn update_of_unknown_result_is_rejected() {
        let err = apply(
            None,
            &event(EventKind::LabResultUpdated, 1, json!({"updates": {"glucose": 1}})),
        )
        .unwrap_err();
        assert!(matches!(err, ProjectionError::RowNotFound { .. }));
    }
}
