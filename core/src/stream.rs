//! Aggregate identification and sequencing types.
//!
//! This module defines strong types for identifying an aggregate's event stream
//! (`AggregateId`) and for positioning events inside it (`Sequence`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of an aggregate identifier, in bytes.
pub const MAX_AGGREGATE_ID_LEN: usize = 128;

/// Error returned when an aggregate identifier is malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate ID: {0}")]
pub struct ParseAggregateIdError(String);

impl ParseAggregateIdError {
    /// Human-readable reason the identifier was rejected.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.0
    }
}

/// Identifier of a single aggregate instance (patient, clinical episode, lab panel).
///
/// An aggregate ID is non-empty, at most [`MAX_AGGREGATE_ID_LEN`] bytes, and
/// contains only ASCII alphanumerics plus `-`, `_`, `.` and `:`. UUIDs and
/// short slugs such as `p1` are both accepted.
///
/// # Validation
///
/// - `FromStr::from_str()` / [`AggregateId::parse`]: validate input
/// - [`AggregateId::new_unchecked`]: no validation (values read back from storage)
///
/// # Examples
///
/// ```
/// use chartlog_core::stream::AggregateId;
///
/// let id: AggregateId = "p1".parse().unwrap();
/// assert_eq!(id.as_str(), "p1");
///
/// assert!("".parse::<AggregateId>().is_err());
/// assert!("has space".parse::<AggregateId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AggregateId(String);

impl AggregateId {
    /// Parse and validate an aggregate identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ParseAggregateIdError`] when the identifier is empty, too long,
    /// or contains characters outside the allowed set.
    pub fn parse(id: &str) -> Result<Self, ParseAggregateIdError> {
        if id.is_empty() {
            return Err(ParseAggregateIdError(
                "aggregate ID cannot be empty".to_string(),
            ));
        }
        if id.len() > MAX_AGGREGATE_ID_LEN {
            return Err(ParseAggregateIdError(format!(
                "aggregate ID exceeds {MAX_AGGREGATE_ID_LEN} bytes"
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(ParseAggregateIdError(format!(
                "aggregate ID contains invalid character {bad:?}"
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// Wrap a string without validation.
    ///
    /// Only for identifiers that were validated before they were persisted.
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AggregateId {
    type Err = ParseAggregateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AggregateId {
    type Error = ParseAggregateIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AggregateId> for String {
    fn from(id: AggregateId) -> Self {
        id.0
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Error returned when a raw integer is not a valid sequence number.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid sequence {0}: sequences start at 1")]
pub struct InvalidSequence(pub i128);

/// Position of an event within its aggregate's stream.
///
/// Sequences start at 1 and increase by exactly one per committed event, so
/// the committed sequences of an aggregate with `N` events are `1..=N`.
///
/// # Examples
///
/// ```
/// use chartlog_core::stream::Sequence;
///
/// let first = Sequence::FIRST;
/// assert_eq!(first.value(), 1);
/// assert_eq!(first.next(), Sequence::try_from(2_i64).unwrap());
/// assert!(Sequence::try_from(0_i64).is_err());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Sequence(u64);

impl Sequence {
    /// Sequence of the first event of every aggregate.
    pub const FIRST: Self = Self(1);

    /// Create a sequence, returning `None` for 0.
    #[must_use]
    pub const fn new(value: u64) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Get the sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence that follows this one.
    ///
    /// Saturates at `u64::MAX`, which no real stream reaches.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The sequence that follows `current`, or [`Sequence::FIRST`] for an empty stream.
    #[must_use]
    pub const fn after(current: Option<Self>) -> Self {
        match current {
            Some(sequence) => sequence.next(),
            None => Self::FIRST,
        }
    }

    /// Check if this is the first sequence of a stream.
    #[must_use]
    pub const fn is_first(self) -> bool {
        self.0 == 1
    }

    /// Value as a signed 64-bit integer, for `BIGINT` columns.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // 2^63 events per aggregate is unreachable
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for Sequence {
    type Error = InvalidSequence;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidSequence(i128::from(value)))
    }
}

impl TryFrom<i64> for Sequence {
    type Error = InvalidSequence;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .ok()
            .and_then(Self::new)
            .ok_or(InvalidSequence(i128::from(value)))
    }
}

impl From<Sequence> for u64 {
    fn from(sequence: Sequence) -> Self {
        sequence.0
    }
}
