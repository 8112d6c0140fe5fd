//! Event records and the closed sets of aggregate and event types.
//!
//! Events are immutable facts about one aggregate. Each one carries its
//! aggregate's type and id, a typed [`EventKind`], a JSON object payload,
//! free-form metadata, and its position ([`Sequence`]) in the aggregate's
//! stream.
//!
//! # Example
//!
//! ```
//! use chartlog_core::event::{AggregateType, EventKind};
//!
//! let kind: EventKind = "PatientRegistered".parse().unwrap();
//! assert_eq!(kind.aggregate_type(), AggregateType::Patient);
//!
//! let aggregate: AggregateType = "PATIENT".parse().unwrap();
//! assert_eq!(aggregate, AggregateType::Patient);
//! ```

use crate::stream::{AggregateId, Sequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// JSON object carried by an event (`eventData`) or its metadata.
pub type Payload = Map<String, Value>;

/// Error returned when a string names no known aggregate or event type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnknownTypeError {
    /// The aggregate type string is not one of the known aggregate types.
    #[error("Unknown aggregate type: {0}")]
    AggregateType(String),

    /// The event type string is not one of the known event kinds.
    #[error("Unknown event type: {0}")]
    EventKind(String),
}

/// The kinds of aggregate whose histories live in the log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateType {
    /// A registered patient.
    Patient,
    /// A clinical episode (vitals, diagnoses, symptoms, medications).
    Clinical,
    /// A lab panel / lab result.
    Lab,
    /// A security principal's access history.
    Security,
}

impl AggregateType {
    /// Every aggregate type, in a stable order.
    pub const ALL: [Self; 4] = [Self::Patient, Self::Clinical, Self::Lab, Self::Security];

    /// Stable lowercase name used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Clinical => "clinical",
            Self::Lab => "lab",
            Self::Security => "security",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = UnknownTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTypeError::AggregateType(s.to_string()))
    }
}

/// Every event type the log accepts.
///
/// Each kind belongs to exactly one [`AggregateType`]; the handler registry
/// decides which `(AggregateType, EventKind)` pairs are actually projected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// A patient was registered.
    PatientRegistered,
    /// Patient demographics were changed (`updates` object).
    PatientUpdated,
    /// A patient record was archived.
    PatientArchived,
    /// Vital signs were recorded.
    VitalsRecorded,
    /// A diagnosis was added.
    DiagnosisAdded,
    /// Symptoms were first captured.
    SymptomsAdded,
    /// Captured symptoms were revised.
    SymptomsUpdated,
    /// A medication was prescribed.
    MedicationPrescribed,
    /// A medication was discontinued.
    MedicationDiscontinued,
    /// A lab result was recorded.
    LabResultRecorded,
    /// A lab result was partially updated.
    LabResultUpdated,
    /// A lab result was cancelled.
    LabResultCancelled,
    /// A principal was granted access to a resource.
    AccessGranted,
    /// A principal's access to a resource was revoked.
    AccessRevoked,
    /// A principal was denied access to a resource.
    AccessDenied,
}

impl EventKind {
    /// Every event kind, in a stable order.
    pub const ALL: [Self; 15] = [
        Self::PatientRegistered,
        Self::PatientUpdated,
        Self::PatientArchived,
        Self::VitalsRecorded,
        Self::DiagnosisAdded,
        Self::SymptomsAdded,
        Self::SymptomsUpdated,
        Self::MedicationPrescribed,
        Self::MedicationDiscontinued,
        Self::LabResultRecorded,
        Self::LabResultUpdated,
        Self::LabResultCancelled,
        Self::AccessGranted,
        Self::AccessRevoked,
        Self::AccessDenied,
    ];

    /// Stable name used in storage and at the API boundary.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PatientRegistered => "PatientRegistered",
            Self::PatientUpdated => "PatientUpdated",
            Self::PatientArchived => "PatientArchived",
            Self::VitalsRecorded => "VitalsRecorded",
            Self::DiagnosisAdded => "DiagnosisAdded",
            Self::SymptomsAdded => "SymptomsAdded",
            Self::SymptomsUpdated => "SymptomsUpdated",
            Self::MedicationPrescribed => "MedicationPrescribed",
            Self::MedicationDiscontinued => "MedicationDiscontinued",
            Self::LabResultRecorded => "LabResultRecorded",
            Self::LabResultUpdated => "LabResultUpdated",
            Self::LabResultCancelled => "LabResultCancelled",
            Self::AccessGranted => "AccessGranted",
            Self::AccessRevoked => "AccessRevoked",
            Self::AccessDenied => "AccessDenied",
        }
    }

    /// The aggregate type this kind of event belongs to.
    #[must_use]
    pub const fn aggregate_type(self) -> AggregateType {
        match self {
            Self::PatientRegistered | Self::PatientUpdated | Self::PatientArchived => {
                AggregateType::Patient
            },
            Self::VitalsRecorded
            | Self::DiagnosisAdded
            | Self::SymptomsAdded
            | Self::SymptomsUpdated
            | Self::MedicationPrescribed
            | Self::MedicationDiscontinued => AggregateType::Clinical,
            Self::LabResultRecorded | Self::LabResultUpdated | Self::LabResultCancelled => {
                AggregateType::Lab
            },
            Self::AccessGranted | Self::AccessRevoked | Self::AccessDenied => {
                AggregateType::Security
            },
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == s)
            .ok_or_else(|| UnknownTypeError::EventKind(s.to_string()))
    }
}

/// An event that has not been committed yet.
///
/// `expected_sequence` lets a caller pin the sequence it believes comes next;
/// when `None` the allocator picks `current max + 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    /// Aggregate type the event belongs to.
    pub aggregate_type: AggregateType,
    /// Aggregate instance the event belongs to.
    pub aggregate_id: AggregateId,
    /// What happened.
    pub kind: EventKind,
    /// Event payload (`eventData`).
    pub payload: Payload,
    /// Correlation, causation, actor and similar metadata.
    pub metadata: Payload,
    /// Sequence the caller insists on, if any.
    pub expected_sequence: Option<Sequence>,
}

impl NewEvent {
    /// Create a new event with empty metadata and no pinned sequence.
    #[must_use]
    pub fn new(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        kind: EventKind,
        payload: Payload,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id,
            kind,
            payload,
            metadata: Payload::new(),
            expected_sequence: None,
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    /// Pin the sequence this event must receive.
    #[must_use]
    pub const fn with_expected_sequence(mut self, sequence: Sequence) -> Self {
        self.expected_sequence = Some(sequence);
        self
    }

    /// Turn this draft into a committed-shape record at `sequence`.
    #[must_use]
    pub fn into_record(self, sequence: Sequence, timestamp: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.kind,
            event_data: self.payload,
            metadata: self.metadata,
            sequence,
            timestamp,
        }
    }
}

/// An immutable entry of the event log.
///
/// Once committed an `EventRecord` is never updated or deleted; corrections
/// are new events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Unique event identifier.
    pub id: Uuid,
    /// Aggregate type of the stream.
    pub aggregate_type: AggregateType,
    /// Aggregate instance of the stream.
    pub aggregate_id: AggregateId,
    /// What happened.
    pub event_type: EventKind,
    /// Event payload.
    pub event_data: Payload,
    /// Event metadata.
    pub metadata: Payload,
    /// Position in the aggregate's stream, starting at 1.
    pub sequence: Sequence,
    /// When the event was committed.
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Look up a payload field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.event_data.get(key)
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventRecord {{ {}/{} #{}: {} }}",
            self.aggregate_type, self.aggregate_id, self.sequence, self.event_type
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aggregate_type_parses_case_insensitively() {
        assert_eq!("PATIENT".parse::<AggregateType>().unwrap(), AggregateType::Patient);
        assert_eq!("lab".parse::<AggregateType>().unwrap(), AggregateType::Lab);
        assert!(matches!(
            "billing".parse::<AggregateType>(),
            Err(UnknownTypeError::AggregateType(name)) if name == "billing"
        ));
    }

    #[test]
    fn event_kind_round_trips_through_its_name() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("PatientDeleted".parse::<EventKind>().is_err());
    }

    #[test]
    fn every_aggregate_type_owns_some_kind() {
        for aggregate in AggregateType::ALL {
            assert!(EventKind::ALL.iter().any(|k| k.aggregate_type() == aggregate));
        }
    }

    #[test]
    fn record_serializes_with_camel_case_fields() {
        let draft = NewEvent::new(
            AggregateType::Patient,
            AggregateId::parse("p1").unwrap(),
            EventKind::PatientRegistered,
            json!({"name": "Jo"}).as_object().cloned().unwrap(),
        );
        let record = draft.into_record(Sequence::FIRST, Utc::now());
        let value = serde_json::to_value(&record).expect("record should serialize");

        assert_eq!(value["aggregateType"], json!("patient"));
        assert_eq!(value["aggregateId"], json!("p1"));
        assert_eq!(value["eventType"], json!("PatientRegistered"));
        assert_eq!(value["eventData"]["name"], json!("Jo"));
        assert_eq!(value["sequence"], json!(1));

        let back: EventRecord = serde_json::from_value(value).expect("record should deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn display_names_stream_and_position() {
        let record = NewEvent::new(
            AggregateType::Lab,
            AggregateId::parse("lab-1").unwrap(),
            EventKind::LabResultRecorded,
            Payload::new(),
        )
        .into_record(Sequence::FIRST, Utc::now());

        let display = record.to_string();
        assert!(display.contains("lab/lab-1 #1"));
        assert!(display.contains("LabResultRecorded"));
    }
}
