//! Security access-log read model.
//!
//! One immutable row per access event. The actor is taken from the payload,
//! falling back to the event metadata's `actor`.

use super::{ProjectionError, ReadModelTx, Result, TxFuture, optional_string};
use crate::event::{AggregateType, EventKind, EventRecord, Payload};
use crate::stream::{AggregateId, Sequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Outcome recorded by an access-log row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    /// Access was granted.
    Granted,
    /// Access was revoked.
    Revoked,
    /// An access attempt was refused.
    Denied,
}

impl AccessAction {
    const fn from_kind(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::AccessGranted => Some(Self::Granted),
            EventKind::AccessRevoked => Some(Self::Revoked),
            EventKind::AccessDenied => Some(Self::Denied),
            _ => None,
        }
    }
}

/// One access-log row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// Id of the producing event (row key).
    pub event_id: Uuid,
    /// Security principal the row belongs to.
    pub aggregate_id: AggregateId,
    /// Sequence of the producing event.
    pub sequence: Sequence,
    /// What happened.
    pub action: AccessAction,
    /// Who performed or requested the access change.
    pub actor: Option<String>,
    /// Resource the access applies to.
    pub resource: String,
    /// Remaining payload fields.
    pub details: Payload,
    /// Timestamp of the producing event.
    pub recorded_at: DateTime<Utc>,
}

/// Every access-log row of a principal, ordered by sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessLog {
    /// Security principal id.
    pub aggregate_id: AggregateId,
    /// Rows in sequence order.
    pub entries: Vec<AccessLogEntry>,
}

impl AccessLog {
    /// Empty log for a principal.
    #[must_use]
    pub const fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            entries: Vec::new(),
        }
    }

    /// Resources currently granted, in grant order.
    #[must_use]
    pub fn active_grants(&self) -> Vec<String> {
        let mut grants: Vec<String> = Vec::new();
        for entry in &self.entries {
            match entry.action {
                AccessAction::Granted => {
                    if !grants.contains(&entry.resource) {
                        grants.push(entry.resource.clone());
                    }
                },
                AccessAction::Revoked => grants.retain(|r| r != &entry.resource),
                AccessAction::Denied => {},
            }
        }
        grants
    }

    /// Entry count, entries and active grants.
    #[must_use]
    pub fn to_snapshot(&self) -> Payload {
        let entries: Vec<Value> = self
            .entries
            .iter()
            .map(|entry| {
                json!({
                    "eventId": entry.event_id,
                    "sequence": entry.sequence,
                    "action": entry.action,
                    "actor": entry.actor,
                    "resource": entry.resource,
                    "details": entry.details,
                    "recordedAt": entry.recorded_at,
                })
            })
            .collect();

        let mut snapshot = Payload::new();
        snapshot.insert("entryCount".to_string(), Value::from(self.entries.len()));
        snapshot.insert("entries".to_string(), Value::Array(entries));
        snapshot.insert("activeGrants".to_string(), json!(self.active_grants()));
        snapshot
    }
}

/// Build the access-log row for `event`.
///
/// # Errors
///
/// `MissingField`/`InvalidField` for a missing or non-string `resource` or
/// `actor`, `UnsupportedEvent` for non-security events.
pub fn apply(event: &EventRecord) -> Result<AccessLogEntry> {
    let action = AccessAction::from_kind(event.event_type).ok_or(ProjectionError::UnsupportedEvent {
        aggregate_type: AggregateType::Security,
        event_type: event.event_type,
    })?;
    let resource = optional_string(event, "resource")?.ok_or(ProjectionError::MissingField {
        event_type: event.event_type,
        field: "resource",
    })?;
    let actor = match optional_string(event, "actor")? {
        Some(actor) => Some(actor),
        None => event
            .metadata
            .get("actor")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    let mut details = event.event_data.clone();
    details.remove("resource");
    details.remove("actor");

    Ok(AccessLogEntry {
        event_id: event.id,
        aggregate_id: event.aggregate_id.clone(),
        sequence: event.sequence,
        action,
        actor,
        resource,
        details,
        recorded_at: event.timestamp,
    })
}

/// Handler: insert the access-log row.
pub fn project<'a>(event: &'a EventRecord, tx: &'a mut dyn ReadModelTx) -> TxFuture<'a, ()> {
    Box::pin(async move {
        let entry = apply(event)?;
        tx.insert_access_entry(entry).await
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::NewEvent;

    fn event(kind: EventKind, sequence: u64, payload: Value) -> EventRecord {
        NewEvent::new(
            AggregateType::Security,
            AggregateId::new_unchecked("user-42"),
            kind,
            payload.as_object().cloned().unwrap(),
        )
        .with_metadata(json!({"actor": "admin"}).as_object().cloned().unwrap())
        .into_record(Sequence::new(sequence).unwrap(), Utc::now())
    }

    #[test]
    fn actor_falls_back_to_metadata() {
        let entry = apply(&event(
            EventKind::AccessGranted,
            1,
            json!({"resource": "patient:p1", "role": "nurse"}),
        ))
        .unwrap();
        assert_eq!(entry.action, AccessAction::Granted);
        assert_eq!(entry.actor.as_deref(), Some("admin"));
        assert_eq!(Value::Object(entry.details), json!({"role": "nurse"}));

        let entry = apply(&event(
            EventKind::AccessDenied,
            2,
            json!({"resource": "patient:p1", "actor": "gatekeeper"}),
        ))
        .unwrap();
        assert_eq!(entry.actor.as_deref(), Some("gatekeeper"));
    }

    #[test]
    fn resource_is_required() {
        let err = apply(&event(EventKind::AccessRevoked, 1, json!({}))).unwrap_err();
        assert!(matches!(err, ProjectionError::MissingField { field: "resource", .. }));
    }

    #[test]
    fn revocation_removes_active_grant() {
        let mut log = AccessLog::new(AggregateId::new_unchecked("user-42"));
        for (n, (kind, resource)) in [
            (EventKind::AccessGranted, "patient:p1"),
            (EventKind::AccessGranted, "lab:l1"),
            (EventKind::AccessRevoked, "patient:p1"),
            (EventKind::AccessDenied, "patient:p9"),
        ]
        .into_iter()
        .enumerate()
        {
            let e = event(kind, n as u64 + 1, json!({ "resource": resource }));
            log.entries.push(apply(&e).unwrap());
        }

        assert_eq!(log.active_grants(), vec!["lab:l1".to_string()]);
        let snapshot = log.to_snapshot();
        assert_eq!(snapshot["entryCount"], json!(4));
        assert_eq!(snapshot["activeGrants"], json!(["lab:l1"]));
    }
}
