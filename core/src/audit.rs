//! Audit trail of create/update/delete actions on tracked entities.
//!
//! The audit trail is recorded alongside the event log, not derived from it.
//! Entries are append-only.

use crate::stream::AggregateId;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors from audit-trail backends.
#[derive(Error, Debug)]
pub enum AuditError {
    /// The entry is malformed.
    #[error("Invalid audit entry: {0}")]
    Invalid(String),

    /// A stored entity reference could not be decoded.
    #[error("Unknown audited entity {kind}:{id}")]
    UnknownEntity {
        /// Stored entity kind.
        kind: String,
        /// Stored entity id.
        id: String,
    },

    /// Database connection or query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Boxed future returned by [`AuditTrail`] methods.
pub type AuditFuture<'a, T> = BoxFuture<'a, Result<T, AuditError>>;

/// The entity an audit entry is about.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    /// A patient aggregate.
    Patient(AggregateId),
    /// A clinical episode aggregate.
    ClinicalEpisode(AggregateId),
    /// A lab result aggregate.
    LabResult(AggregateId),
    /// A free-standing note.
    Note(Uuid),
}

impl EntityRef {
    /// Storage name of the entity kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Patient(_) => "patient",
            Self::ClinicalEpisode(_) => "clinical_episode",
            Self::LabResult(_) => "lab_result",
            Self::Note(_) => "note",
        }
    }

    /// Storage form of the entity id.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Patient(id) | Self::ClinicalEpisode(id) | Self::LabResult(id) => id.to_string(),
            Self::Note(id) => id.to_string(),
        }
    }

    /// Rebuild a reference from its stored `kind` and `id`.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` for an unknown kind or an id that does not parse.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, AuditError> {
        let unknown = || AuditError::UnknownEntity {
            kind: kind.to_string(),
            id: id.to_string(),
        };
        let aggregate = || AggregateId::parse(id).map_err(|_| unknown());
        match kind {
            "patient" => Ok(Self::Patient(aggregate()?)),
            "clinical_episode" => Ok(Self::ClinicalEpisode(aggregate()?)),
            "lab_result" => Ok(Self::LabResult(aggregate()?)),
            "note" => Uuid::parse_str(id).map(Self::Note).map_err(|_| unknown()),
            _ => Err(unknown()),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// What was done to the entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Entity created.
    Create,
    /// Entity modified.
    Update,
    /// Entity deleted.
    Delete,
}

impl AuditAction {
    /// Storage name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse a stored action name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One audit-trail row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Entry id.
    pub id: Uuid,
    /// Audited entity.
    pub entity: EntityRef,
    /// What was done.
    pub action: AuditAction,
    /// Who did it.
    pub actor: String,
    /// Values before the action (`null` for creates).
    pub previous_values: Value,
    /// Values after the action (`null` for deletes).
    pub new_values: Value,
    /// When the action happened.
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build an entry with a fresh id.
    ///
    /// # Errors
    ///
    /// `Invalid` when `actor` is blank.
    pub fn new(
        entity: EntityRef,
        action: AuditAction,
        actor: impl Into<String>,
        previous_values: Value,
        new_values: Value,
        recorded_at: DateTime<Utc>,
    ) -> Result<Self, AuditError> {
        let actor = actor.into();
        if actor.trim().is_empty() {
            return Err(AuditError::Invalid("actor cannot be empty".to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            entity,
            action,
            actor,
            previous_values,
            new_values,
            recorded_at,
        })
    }
}

/// Append-only audit-trail backend.
pub trait AuditTrail: Send + Sync {
    /// Append an entry.
    ///
    /// # Errors
    ///
    /// `Invalid` or backend failures.
    fn record(&self, entry: AuditEntry) -> AuditFuture<'_, ()>;

    /// Every entry about `entity`, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn history(&self, entity: EntityRef) -> AuditFuture<'_, Vec<AuditEntry>>;
}
