//! Per-aggregate sequence allocation.
//!
//! Sequences are allocated optimistically: read the stream's current maximum,
//! claim `max + 1`, and let the store's uniqueness guard decide the winner when
//! two writers claim the same number. The loser receives
//! [`EventStoreError::SequenceConflict`] and must re-read and retry; sequences
//! are never silently renumbered or skipped.
//!
//! The allocator itself is pure policy. The guard lives in each
//! [`EventStore`](crate::event_store::EventStore) implementation.

use crate::event::{AggregateType, EventRecord, NewEvent};
use crate::event_store::EventStoreError;
use crate::stream::{AggregateId, Sequence};

/// A sequence claimed for one append attempt, not yet committed.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAppend {
    /// The event to commit.
    pub event: NewEvent,
    /// The sequence it will be committed at.
    pub sequence: Sequence,
}

/// Sequence allocation policy.
#[derive(Copy, Clone, Debug, Default)]
pub struct SequenceAllocator;

impl SequenceAllocator {
    /// Decide the sequence for the next event of a stream.
    ///
    /// - no `requested` sequence: `current + 1`, or 1 for an empty stream
    /// - a `requested` sequence must be exactly that value; anything else is
    ///   rejected, never corrected
    ///
    /// # Errors
    ///
    /// `ValidationError` when `requested` is not the next sequence (including a
    /// first event that is not 1).
    pub fn claim(
        current: Option<Sequence>,
        requested: Option<Sequence>,
    ) -> Result<Sequence, EventStoreError> {
        let next = Sequence::after(current);
        match requested {
            None => Ok(next),
            Some(sequence) if sequence == next => Ok(sequence),
            Some(sequence) if current.is_none() => Err(EventStoreError::validation(
                "sequence",
                format!("first event of an aggregate must have sequence 1, got {sequence}"),
            )),
            Some(sequence) => Err(EventStoreError::validation(
                "sequence",
                format!("expected sequence {next}, got {sequence}"),
            )),
        }
    }

    /// Claim a sequence for `event` given the stream's current maximum.
    ///
    /// # Errors
    ///
    /// See [`SequenceAllocator::claim`].
    pub fn reserve(event: NewEvent, current: Option<Sequence>) -> Result<PendingAppend, EventStoreError> {
        let sequence = Self::claim(current, event.expected_sequence)?;
        Ok(PendingAppend { event, sequence })
    }

    /// Guard used by stores at insert time.
    ///
    /// `claimed` must still be free: anything at or below the committed maximum
    /// lost a race. A claim beyond `current + 1` would open a gap and is
    /// treated the same way, since only a stale or forged reservation gets there.
    ///
    /// # Errors
    ///
    /// `SequenceConflict` when `claimed` is not `current + 1`.
    pub fn guard(
        aggregate_type: AggregateType,
        aggregate_id: &AggregateId,
        current: Option<Sequence>,
        claimed: Sequence,
    ) -> Result<(), EventStoreError> {
        if claimed == Sequence::after(current) {
            Ok(())
        } else {
            Err(EventStoreError::SequenceConflict {
                aggregate_type,
                aggregate_id: aggregate_id.clone(),
                sequence: claimed,
            })
        }
    }

    /// Check that a loaded history is exactly `1..=N` for a single stream.
    ///
    /// # Errors
    ///
    /// `ReplayFailed` naming the first event that breaks the invariant.
    pub fn verify_history(events: &[EventRecord]) -> Result<(), EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let mut expected = Sequence::FIRST;
        for event in events {
            if event.aggregate_type != first.aggregate_type
                || event.aggregate_id != first.aggregate_id
            {
                return Err(EventStoreError::ReplayFailed {
                    sequence: event.sequence.value(),
                    reason: format!(
                        "history mixes streams {}/{} and {}/{}",
                        first.aggregate_type,
                        first.aggregate_id,
                        event.aggregate_type,
                        event.aggregate_id
                    ),
                });
            }
            if event.sequence != expected {
                return Err(EventStoreError::ReplayFailed {
                    sequence: event.sequence.value(),
                    reason: format!("expected sequence {expected}, found {}", event.sequence),
                });
            }
            expected = expected.next();
        }
        Ok(())
    }
}
