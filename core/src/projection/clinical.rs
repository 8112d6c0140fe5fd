//! Clinical read model.
//!
//! Every clinical event inserts a new immutable [`ClinicalEntry`]; rows are
//! never updated in place. Each entry carries the episode's denormalised
//! `symptomsSummary` and `providerDetails` as of that event: the previous
//! entry's documents with the payload's patches merged over them.

use super::{Merge, ProjectionError, ReadModelTx, Result, TxFuture, object_field};
use crate::event::{AggregateType, EventKind, EventRecord, Payload};
use crate::stream::{AggregateId, Sequence};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

const SYMPTOMS_SUMMARY: &str = "symptomsSummary";
const PROVIDER_DETAILS: &str = "providerDetails";

/// Denormalised summary of the episode's symptoms.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymptomsSummary {
    /// Number of merges applied.
    pub version: u32,
    /// Presenting complaint.
    pub chief_complaint: Option<String>,
    /// Reported symptoms.
    pub symptoms: Option<Vec<String>>,
    /// Overall severity.
    pub severity: Option<String>,
    /// Onset description.
    pub onset: Option<String>,
    /// Free-text notes.
    pub notes: Option<String>,
}

/// Partial [`SymptomsSummary`] carried by an event payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SymptomsPatch {
    /// New presenting complaint.
    pub chief_complaint: Option<String>,
    /// New symptom list (replaces the previous list).
    pub symptoms: Option<Vec<String>>,
    /// New severity.
    pub severity: Option<String>,
    /// New onset description.
    pub onset: Option<String>,
    /// New notes.
    pub notes: Option<String>,
}

impl Merge for SymptomsSummary {
    type Patch = SymptomsPatch;

    fn merge(&mut self, patch: SymptomsPatch) {
        overwrite(&mut self.chief_complaint, patch.chief_complaint);
        overwrite(&mut self.symptoms, patch.symptoms);
        overwrite(&mut self.severity, patch.severity);
        overwrite(&mut self.onset, patch.onset);
        overwrite(&mut self.notes, patch.notes);
        self.version += 1;
    }
}

/// Denormalised details of the treating provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDetails {
    /// Number of merges applied.
    pub version: u32,
    /// Provider identifier.
    pub provider_id: Option<String>,
    /// Provider display name.
    pub name: Option<String>,
    /// Specialty.
    pub specialty: Option<String>,
    /// Facility the provider works at.
    pub facility: Option<String>,
    /// Contact details.
    pub contact: Option<String>,
}

/// Partial [`ProviderDetails`] carried by an event payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderPatch {
    /// New provider identifier.
    pub provider_id: Option<String>,
    /// New display name.
    pub name: Option<String>,
    /// New specialty.
    pub specialty: Option<String>,
    /// New facility.
    pub facility: Option<String>,
    /// New contact details.
    pub contact: Option<String>,
}

impl Merge for ProviderDetails {
    type Patch = ProviderPatch;

    fn merge(&mut self, patch: ProviderPatch) {
        overwrite(&mut self.provider_id, patch.provider_id);
        overwrite(&mut self.name, patch.name);
        overwrite(&mut self.specialty, patch.specialty);
        overwrite(&mut self.facility, patch.facility);
        overwrite(&mut self.contact, patch.contact);
        self.version += 1;
    }
}

fn overwrite<T>(slot: &mut Option<T>, patch: Option<T>) {
    if patch.is_some() {
        *slot = patch;
    }
}

/// One immutable clinical row, keyed by the event that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClinicalEntry {
    /// Id of the producing event (row key).
    pub event_id: Uuid,
    /// Clinical episode the entry belongs to.
    pub aggregate_id: AggregateId,
    /// Sequence of the producing event.
    pub sequence: Sequence,
    /// Kind of entry.
    pub entry_type: EventKind,
    /// Payload minus the denormalised sub-documents.
    pub data: Payload,
    /// Symptoms summary as of this entry.
    pub symptoms_summary: Option<SymptomsSummary>,
    /// Provider details as of this entry.
    pub provider_details: Option<ProviderDetails>,
    /// Timestamp of the producing event.
    pub recorded_at: DateTime<Utc>,
}

impl ClinicalEntry {
    /// Medication name for prescription and discontinuation entries.
    #[must_use]
    pub fn medication_name(&self) -> Option<&str> {
        match self.data.get("medication")? {
            Value::String(name) => Some(name),
            Value::Object(medication) => medication.get("name")?.as_str(),
            _ => None,
        }
    }
}

/// Every clinical entry of an episode, ordered by sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    /// Clinical episode id.
    pub aggregate_id: AggregateId,
    /// Entries in sequence order.
    pub entries: Vec<ClinicalEntry>,
}

impl ClinicalRecord {
    /// Empty record for an episode.
    #[must_use]
    pub const fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            entries: Vec::new(),
        }
    }

    /// Medications prescribed and not discontinued since, in prescription order.
    #[must_use]
    pub fn active_medications(&self) -> Vec<String> {
        let mut active: Vec<String> = Vec::new();
        for entry in &self.entries {
            let Some(name) = entry.medication_name() else {
                continue;
            };
            match entry.entry_type {
                EventKind::MedicationPrescribed => {
                    if !active.iter().any(|m| m == name) {
                        active.push(name.to_string());
                    }
                },
                EventKind::MedicationDiscontinued => active.retain(|m| m != name),
                _ => {},
            }
        }
        active
    }

    /// Entry count, entries, latest sub-documents and active medications.
    #[must_use]
    pub fn to_snapshot(&self) -> Payload {
        let latest = self.entries.last();
        let entries: Vec<Value> = self
            .entries
            .iter()
            .map(|entry| {
                json!({
                    "eventId": entry.event_id,
                    "sequence": entry.sequence,
                    "entryType": entry.entry_type,
                    "data": entry.data,
                    "recordedAt": entry.recorded_at,
                })
            })
            .collect();

        let mut snapshot = Payload::new();
        snapshot.insert("entryCount".to_string(), Value::from(self.entries.len()));
        snapshot.insert("entries".to_string(), Value::Array(entries));
        snapshot.insert(
            SYMPTOMS_SUMMARY.to_string(),
            json!(latest.and_then(|e| e.symptoms_summary.as_ref())),
        );
        snapshot.insert(
            PROVIDER_DETAILS.to_string(),
            json!(latest.and_then(|e| e.provider_details.as_ref())),
        );
        snapshot.insert(
            "activeMedications".to_string(),
            json!(self.active_medications()),
        );
        snapshot
    }
}

/// Build the entry for `event`, carrying sub-documents forward from `previous`.
///
/// # Errors
///
/// - `MissingField`/`InvalidField` for a malformed payload or sub-document
/// - `UnsupportedEvent` for non-clinical events
pub fn apply(previous: Option<&ClinicalEntry>, event: &EventRecord) -> Result<ClinicalEntry> {
    let required = match event.event_type {
        EventKind::VitalsRecorded => "vitals",
        EventKind::DiagnosisAdded => "diagnosis",
        EventKind::SymptomsAdded | EventKind::SymptomsUpdated => SYMPTOMS_SUMMARY,
        EventKind::MedicationPrescribed | EventKind::MedicationDiscontinued => "medication",
        other => {
            return Err(ProjectionError::UnsupportedEvent {
                aggregate_type: AggregateType::Clinical,
                event_type: other,
            });
        },
    };
    if matches!(event.field(required), None | Some(Value::Null)) {
        return Err(ProjectionError::MissingField {
            event_type: event.event_type,
            field: required,
        });
    }

    let mut symptoms_summary = previous.and_then(|p| p.symptoms_summary.clone());
    if let Some(patch) = patch_field::<SymptomsPatch>(event, SYMPTOMS_SUMMARY)? {
        symptoms_summary.get_or_insert_with(SymptomsSummary::default).merge(patch);
    }

    let mut provider_details = previous.and_then(|p| p.provider_details.clone());
    if let Some(patch) = patch_field::<ProviderPatch>(event, PROVIDER_DETAILS)? {
        provider_details.get_or_insert_with(ProviderDetails::default).merge(patch);
    }

    let mut data = event.event_data.clone();
    data.remove(SYMPTOMS_SUMMARY);
    data.remove(PROVIDER_DETAILS);

    let entry = ClinicalEntry {
        event_id: event.id,
        aggregate_id: event.aggregate_id.clone(),
        sequence: event.sequence,
        entry_type: event.event_type,
        data,
        symptoms_summary,
        provider_details,
        recorded_at: event.timestamp,
    };

    if matches!(
        event.event_type,
        EventKind::MedicationPrescribed | EventKind::MedicationDiscontinued
    ) && entry.medication_name().is_none()
    {
        return Err(ProjectionError::InvalidField {
            event_type: event.event_type,
            field: "medication",
            message: "expected a name or an object with a `name`".to_string(),
        });
    }

    Ok(entry)
}

fn patch_field<P: DeserializeOwned>(event: &EventRecord, field: &'static str) -> Result<Option<P>> {
    match event.field(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => {
            let object = object_field(event, field)?;
            serde_json::from_value(Value::Object(object.clone()))
                .map(Some)
                .map_err(|e| ProjectionError::InvalidField {
                    event_type: event.event_type,
                    field,
                    message: e.to_string(),
                })
        },
    }
}

/// Handler: insert a new entry derived from the episode's latest one.
pub fn project<'a>(event: &'a EventRecord, tx: &'a mut dyn ReadModelTx) -> TxFuture<'a, ()> {
    Box::pin(async move {
        let previous = tx.last_clinical_entry(event.aggregate_id.clone()).await?;
        let entry = apply(previous.as_ref(), event)?;
        tx.insert_clinical_entry(entry).await
    })
}
