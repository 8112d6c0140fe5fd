//! In-memory backends for fast, deterministic tests.
//!
//! - [`InMemoryEventStore`]: event log plus read models, one writer lock per aggregate
//! - [`InMemoryAuditTrail`]: append-only audit entries

use chartlog_core::audit::{AuditEntry, AuditError, AuditFuture, AuditTrail, EntityRef};
use chartlog_core::event::{AggregateType, EventRecord};
use chartlog_core::event_store::{EventStore, EventStoreError, StoreFuture};
use chartlog_core::handler::Dispatcher;
use chartlog_core::projection::{
    AccessLog, AccessLogEntry, ClinicalEntry, ClinicalRecord, LabView, PatientView, ProjectionError,
    ReadModel, ReadModelTx, TxFuture,
};
use chartlog_core::sequence::SequenceAllocator;
use chartlog_core::stream::{AggregateId, Sequence};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Mutex as AsyncMutex;

/// Committed state of one aggregate id.
///
/// Readers clone the `Arc` and never wait on a writer.
#[derive(Clone, Debug, Default)]
struct Committed {
    owner: Option<AggregateType>,
    events: Vec<EventRecord>,
    patient: Option<PatientView>,
    clinical: Vec<ClinicalEntry>,
    lab: Option<LabView>,
    access: Vec<AccessLogEntry>,
}

impl Committed {
    fn current_sequence(&self) -> Option<Sequence> {
        self.events.last().map(|event| event.sequence)
    }

    fn read_model(&self, aggregate_id: &AggregateId) -> Option<ReadModel> {
        match self.owner? {
            AggregateType::Patient => self.patient.clone().map(ReadModel::Patient),
            AggregateType::Clinical => (!self.clinical.is_empty()).then(|| {
                ReadModel::Clinical(ClinicalRecord {
                    aggregate_id: aggregate_id.clone(),
                    entries: self.clinical.clone(),
                })
            }),
            AggregateType::Lab => self.lab.clone().map(ReadModel::Lab),
            AggregateType::Security => (!self.access.is_empty()).then(|| {
                ReadModel::Security(AccessLog {
                    aggregate_id: aggregate_id.clone(),
                    entries: self.access.clone(),
                })
            }),
        }
    }

    fn apply(&mut self, event: EventRecord, staged: Staged) {
        self.owner = Some(event.aggregate_type);
        self.events.push(event);
        if let Some(patient) = staged.patient {
            self.patient = Some(patient);
        }
        self.clinical.extend(staged.clinical);
        if let Some(lab) = staged.lab {
            self.lab = Some(lab);
        }
        self.access.extend(staged.access);
    }
}

/// One aggregate id: a writer lock plus the latest committed state.
#[derive(Debug, Default)]
struct Slot {
    writer: AsyncMutex<()>,
    committed: Mutex<Arc<Committed>>,
}

impl Slot {
    fn committed(&self) -> Arc<Committed> {
        Arc::clone(&*self.committed.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A writer's handle on a slot.
///
/// Dropping it removes the slot again when nothing was ever committed to it
/// and no other writer holds it, so a rejected first append leaves no slot
/// behind.
struct SlotLease<'a> {
    store: &'a InMemoryEventStore,
    aggregate_id: AggregateId,
    slot: Arc<Slot>,
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        let mut slots = self.store.slots();
        let ours = slots
            .get(&self.aggregate_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.slot));
        // One reference from the map, one from this lease.
        if ours && Arc::strong_count(&self.slot) == 2 && self.slot.committed().events.is_empty() {
            slots.remove(&self.aggregate_id);
        }
    }
}

/// Projection writes of one append, applied only once the handler succeeded.
#[derive(Debug, Default)]
struct Staged {
    patient: Option<PatientView>,
    clinical: Vec<ClinicalEntry>,
    lab: Option<LabView>,
    access: Vec<AccessLogEntry>,
}

/// [`ReadModelTx`] over a committed state: reads see staged writes first.
struct StagedTx<'a> {
    aggregate_id: &'a AggregateId,
    committed: &'a Committed,
    staged: Staged,
}

impl StagedTx<'_> {
    fn check_row(&self, row: &AggregateId) -> Result<(), ProjectionError> {
        if row == self.aggregate_id {
            Ok(())
        } else {
            Err(ProjectionError::Storage(format!(
                "row {row} is outside the appended aggregate {}",
                self.aggregate_id
            )))
        }
    }
}

impl ReadModelTx for StagedTx<'_> {
    fn load_patient(&mut self, aggregate_id: AggregateId) -> TxFuture<'_, Option<PatientView>> {
        let result = self
            .check_row(&aggregate_id)
            .map(|()| self.staged.patient.clone().or_else(|| self.committed.patient.clone()));
        Box::pin(async move { result })
    }

    fn save_patient(&mut self, view: PatientView) -> TxFuture<'_, ()> {
        let result = self.check_row(&view.aggregate_id);
        if result.is_ok() {
            self.staged.patient = Some(view);
        }
        Box::pin(async move { result })
    }

    fn last_clinical_entry(
        &mut self,
        aggregate_id: AggregateId,
    ) -> TxFuture<'_, Option<ClinicalEntry>> {
        let result = self.check_row(&aggregate_id).map(|()| {
            self.staged
                .clinical
                .last()
                .or_else(|| self.committed.clinical.last())
                .cloned()
        });
        Box::pin(async move { result })
    }

    fn insert_clinical_entry(&mut self, entry: ClinicalEntry) -> TxFuture<'_, ()> {
        let result = self.check_row(&entry.aggregate_id);
        if result.is_ok() {
            self.staged.clinical.push(entry);
        }
        Box::pin(async move { result })
    }

    fn load_lab(&mut self, result_id: AggregateId) -> TxFuture<'_, Option<LabView>> {
        let result = self
            .check_row(&result_id)
            .map(|()| self.staged.lab.clone().or_else(|| self.committed.lab.clone()));
        Box::pin(async move { result })
    }

    fn save_lab(&mut self, view: LabView) -> TxFuture<'_, ()> {
        let result = self.check_row(&view.result_id);
        if result.is_ok() {
            self.staged.lab = Some(view);
        }
        Box::pin(async move { result })
    }

    fn insert_access_entry(&mut self, entry: AccessLogEntry) -> TxFuture<'_, ()> {
        let result = self.check_row(&entry.aggregate_id);
        if result.is_ok() {
            self.staged.access.push(entry);
        }
        Box::pin(async move { result })
    }
}

/// In-memory event store.
///
/// Each aggregate id has its own writer lock; the map of slots is locked only
/// long enough to find or create a slot, so appends to different aggregates
/// never wait on each other. A commit holds its slot's writer lock while the
/// handler runs, then swaps in the new committed state without awaiting, so
/// an append dropped mid-way leaves nothing behind. Reads take the committed
/// state as it stands and never wait for an in-flight append.
///
/// # Example
///
/// ```
/// use chartlog_testing::InMemoryEventStore;
///
/// let store = InMemoryEventStore::new();
/// assert_eq!(store.event_count(), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    slots: Arc<Mutex<HashMap<AggregateId, Arc<Slot>>>>,
}

impl InMemoryEventStore {
    /// Create a new empty in-memory event store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<AggregateId, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn committed(&self, aggregate_id: &AggregateId) -> Option<Arc<Committed>> {
        self.slots().get(aggregate_id).map(|slot| slot.committed())
    }

    fn lease(&self, aggregate_id: &AggregateId) -> SlotLease<'_> {
        let slot = Arc::clone(self.slots().entry(aggregate_id.clone()).or_default());
        SlotLease {
            store: self,
            aggregate_id: aggregate_id.clone(),
            slot,
        }
    }

    /// Total number of committed events across all aggregates.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.slots()
            .values()
            .map(|slot| slot.committed().events.len())
            .sum()
    }

    /// Number of aggregates with at least one committed event.
    #[must_use]
    pub fn aggregate_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| !slot.committed().events.is_empty())
            .count()
    }

    /// Clear all events and read models (for test isolation).
    pub fn clear(&self) {
        self.slots().clear();
    }
}

impl EventStore for InMemoryEventStore {
    fn current_sequence(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> StoreFuture<'_, Option<Sequence>> {
        Box::pin(async move {
            let Some(committed) = self.committed(&aggregate_id) else {
                return Ok(None);
            };
            match committed.owner {
                Some(owner) if owner != aggregate_type => Ok(None),
                _ => Ok(committed.current_sequence()),
            }
        })
    }

    fn commit<'a>(
        &'a self,
        event: EventRecord,
        dispatcher: &'a Dispatcher,
    ) -> StoreFuture<'a, EventRecord> {
        Box::pin(async move {
            let lease = self.lease(&event.aggregate_id);
            let _writer = lease.slot.writer.lock().await;
            let committed = lease.slot.committed();

            if let Some(owner) = committed.owner {
                if owner != event.aggregate_type {
                    return Err(EventStoreError::validation(
                        "aggregate_id",
                        format!(
                            "aggregate {} belongs to aggregate type {owner}, not {}",
                            event.aggregate_id, event.aggregate_type
                        ),
                    ));
                }
            }
            SequenceAllocator::guard(
                event.aggregate_type,
                &event.aggregate_id,
                committed.current_sequence(),
                event.sequence,
            )?;

            let staged = {
                let mut tx = StagedTx {
                    aggregate_id: &event.aggregate_id,
                    committed: &*committed,
                    staged: Staged::default(),
                };
                dispatcher.dispatch(&event, &mut tx).await?;
                tx.staged
            };

            // No awaits past this point.
            drop(committed);
            let mut current = lease.slot.committed.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::make_mut(&mut *current).apply(event.clone(), staged);
            Ok(event)
        })
    }

    fn load_events(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Vec<EventRecord>> {
        Box::pin(async move {
            Ok(self
                .committed(&aggregate_id)
                .map(|committed| committed.events.clone())
                .unwrap_or_default())
        })
    }

    fn load_read_model(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Option<ReadModel>> {
        Box::pin(async move {
            Ok(self
                .committed(&aggregate_id)
                .and_then(|committed| committed.read_model(&aggregate_id)))
        })
    }
}

/// In-memory audit trail.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAuditTrail {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditTrail {
    /// Create a new empty audit trail
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditTrail for InMemoryAuditTrail {
    fn record(&self, entry: AuditEntry) -> AuditFuture<'_, ()> {
        Box::pin(async move {
            if entry.actor.trim().is_empty() {
                return Err(AuditError::Invalid("actor cannot be empty".to_string()));
            }
            self.entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry);
            Ok(())
        })
    }

    fn history(&self, entity: EntityRef) -> AuditFuture<'_, Vec<AuditEntry>> {
        Box::pin(async move {
            let mut history: Vec<AuditEntry> = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|entry| entry.entity == entity)
                .cloned()
                .collect();
            history.sort_by_key(|entry| entry.recorded_at);
            Ok(history)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use chartlog_core::audit::AuditAction;
    use chartlog_core::event::{EventKind, NewEvent};
    use chrono::Utc;
    use serde_json::{Value, json};

    fn record(kind: EventKind, id: &str, sequence: u64, payload: Value) -> EventRecord {
        NewEvent::new(
            kind.aggregate_type(),
            AggregateId::new_unchecked(id),
            kind,
            payload.as_object().cloned().unwrap(),
        )
        .into_record(Sequence::new(sequence).unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn commit_stores_event_and_projection() {
        let store = InMemoryEventStore::new();
        let dispatcher = Dispatcher::standard();

        store
            .commit(record(EventKind::PatientRegistered, "p1", 1, json!({"name": "Jo"})), &dispatcher)
            .await
            .unwrap();

        let id = AggregateId::new_unchecked("p1");
        assert_eq!(
            store.current_sequence(AggregateType::Patient, id.clone()).await.unwrap(),
            Some(Sequence::FIRST)
        );
        let Some(ReadModel::Patient(view)) = store.load_read_model(id).await.unwrap() else {
            panic!("expected a patient read model");
        };
        assert_eq!(view.version, 1);
        assert_eq!(store.event_count(), 1);
        assert_eq!(store.aggregate_count(), 1);
    }

    #[tokio::test]
    async fn taken_sequence_is_a_conflict() {
        let store = InMemoryEventStore::new();
        let dispatcher = Dispatcher::standard();
        let first = record(EventKind::PatientRegistered, "p2", 1, json!({}));
        let second = record(EventKind::PatientRegistered, "p2", 1, json!({}));

        store.commit(first, &dispatcher).await.unwrap();
        let err = store.commit(second, &dispatcher).await.unwrap_err();

        assert!(matches!(err, EventStoreError::SequenceConflict { .. }));
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn failed_projection_leaves_no_trace() {
        let store = InMemoryEventStore::new();
        let dispatcher = Dispatcher::standard();

        let err = store
            .commit(record(EventKind::LabResultUpdated, "lab-1", 1, json!({"updates": {}})), &dispatcher)
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::ProjectionFailure { .. }));
        let id = AggregateId::new_unchecked("lab-1");
        assert!(store.load_events(id.clone()).await.unwrap().is_empty());
        assert!(store.load_read_model(id).await.unwrap().is_none());
        assert!(store.slots().is_empty());
    }

    #[tokio::test]
    async fn rejected_first_appends_do_not_accumulate_slots() {
        let store = InMemoryEventStore::new();
        let dispatcher = Dispatcher::standard();

        for n in 0..5 {
            let id = format!("lab-{n}");
            store
                .commit(record(EventKind::LabResultUpdated, &id, 1, json!({"updates": {}})), &dispatcher)
                .await
                .unwrap_err();
            store
                .commit(record(EventKind::PatientUpdated, &id, 1, json!({"updates": {}})), &dispatcher)
                .await
                .unwrap_err();
        }
        assert!(store.slots().is_empty());

        store
            .commit(record(EventKind::PatientRegistered, "p1", 1, json!({})), &dispatcher)
            .await
            .unwrap();
        store
            .commit(record(EventKind::PatientRegistered, "p1", 1, json!({})), &dispatcher)
            .await
            .unwrap_err();
        assert_eq!(store.slots().len(), 1);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn aggregate_id_is_owned_by_one_type() {
        let store = InMemoryEventStore::new();
        let dispatcher = Dispatcher::standard();
        store
            .commit(record(EventKind::PatientRegistered, "x1", 1, json!({})), &dispatcher)
            .await
            .unwrap();

        let err = store
            .commit(record(EventKind::LabResultRecorded, "x1", 2, json!({"results": {}})), &dispatcher)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::ValidationError { field: "aggregate_id", .. }));
        assert_eq!(
            store
                .current_sequence(AggregateType::Lab, AggregateId::new_unchecked("x1"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn audit_history_is_per_entity() {
        let trail = InMemoryAuditTrail::new();
        let patient = EntityRef::Patient(AggregateId::new_unchecked("p1"));
        let other = EntityRef::Patient(AggregateId::new_unchecked("p2"));

        for (entity, action) in [
            (patient.clone(), AuditAction::Create),
            (other.clone(), AuditAction::Create),
            (patient.clone(), AuditAction::Update),
        ] {
            let entry = AuditEntry::new(entity, action, "dr-ada", Value::Null, json!({}), Utc::now())
                .unwrap();
            trail.record(entry).await.unwrap();
        }

        let history = trail.history(patient).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(trail.len(), 3);
    }
}
