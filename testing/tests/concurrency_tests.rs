//! Concurrent appends, cancellation and fold/read-model agreement.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use chartlog_core::event::{AggregateType, EventKind, EventRecord};
use chartlog_core::event_store::EventStoreError;
use chartlog_core::handler::{Dispatcher, HandlerRegistry};
use chartlog_core::projection::{ReadModelTx, TxFuture, patient};
use chartlog_runtime::{EventLogConfig, RetryPolicy};
use chartlog_testing::fixtures::{event_log, event_log_with};
use futures::future::join_all;
use proptest::prelude::*;
use serde_json::{Value, json};
use std::time::{Duration, Instant};

fn sequences(events: &[EventRecord]) -> Vec<u64> {
    events.iter().map(|e| e.sequence.value()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_aggregates_append_in_parallel_without_conflicts() {
    let config = EventLogConfig {
        retry: RetryPolicy::no_retry(),
        ..EventLogConfig::default()
    };
    let (log, store) = event_log_with(Dispatcher::standard(), config);

    let tasks = (0..16).map(|n| {
        let log = log.clone();
        tokio::spawn(async move {
            let id = format!("patient-{n}");
            log.append("patient", &id, "PatientRegistered", json!({"n": n}), None)
                .await?;
            for i in 0..9 {
                log.append("patient", &id, "PatientUpdated", json!({"updates": {"i": i}}), None)
                    .await?;
            }
            Ok::<_, EventStoreError>(id)
        })
    });

    for result in join_all(tasks).await {
        let id = result.unwrap().unwrap();
        let events = log.get_events(&id, None).await.unwrap();
        assert_eq!(sequences(&events), (1..=10).collect::<Vec<_>>());
    }
    assert_eq!(store.aggregate_count(), 16);
    assert_eq!(store.event_count(), 160);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_writers_on_one_aggregate_stay_gapless() {
    let config = EventLogConfig {
        retry: RetryPolicy::builder()
            .max_retries(200)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build(),
        append_timeout: Duration::from_secs(30),
    };
    let (log, _store) = event_log_with(Dispatcher::standard(), config);
    log.append("patient", "shared", "PatientRegistered", json!({}), None)
        .await
        .unwrap();

    let writers = (0..12).map(|n| {
        let log = log.clone();
        tokio::spawn(async move {
            log.append("patient", "shared", "PatientUpdated", json!({"updates": {"writer": n}}), None)
                .await
        })
    });
    for result in join_all(writers).await {
        result.unwrap().unwrap();
    }

    let events = log.get_events("shared", None).await.unwrap();
    assert_eq!(sequences(&events), (1..=13).collect::<Vec<_>>());

    let snapshot = log.get_snapshot("shared").await.unwrap().unwrap();
    assert_eq!(snapshot["version"], json!(13));
    log.verify_projection("shared").await.unwrap();
}

fn slow_register<'a>(event: &'a EventRecord, tx: &'a mut dyn ReadModelTx) -> TxFuture<'a, ()> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        patient::project(event, tx).await
    })
}

#[tokio::test]
async fn timed_out_append_leaves_no_trace() {
    let registry = HandlerRegistry::new().with(
        AggregateType::Patient,
        EventKind::PatientRegistered,
        "patient.registered.slow",
        slow_register,
    );
    let config = EventLogConfig {
        append_timeout: Duration::from_millis(20),
        ..EventLogConfig::default()
    };
    let (log, store) = event_log_with(Dispatcher::new(registry), config);

    let err = log
        .append("patient", "slow-1", "PatientRegistered", json!({"name": "Jo"}), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EventStoreError::Timeout(d) if d == Duration::from_millis(20)));
    assert!(log.get_events("slow-1", None).await.unwrap().is_empty());
    assert!(log.get_read_model("slow-1").await.unwrap().is_none());
    assert_eq!(store.event_count(), 0);
}

fn slow_update<'a>(event: &'a EventRecord, tx: &'a mut dyn ReadModelTx) -> TxFuture<'a, ()> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        patient::project(event, tx).await
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_do_not_wait_for_an_in_flight_append() {
    let registry = HandlerRegistry::new()
        .with(
            AggregateType::Patient,
            EventKind::PatientRegistered,
            "patient.registered",
            patient::project,
        )
        .with(
            AggregateType::Patient,
            EventKind::PatientUpdated,
            "patient.updated.slow",
            slow_update,
        );
    let (log, _store) = event_log_with(Dispatcher::new(registry), EventLogConfig::default());
    log.append("patient", "p1", "PatientRegistered", json!({"name": "Jo"}), None)
        .await
        .unwrap();

    let writer = {
        let log = log.clone();
        tokio::spawn(async move {
            log.append("patient", "p1", "PatientUpdated", json!({"updates": {"name": "Joanna"}}), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let events = log.get_events("p1", None).await.unwrap();
    let snapshot = log.get_snapshot("p1").await.unwrap().unwrap();
    let waited = started.elapsed();

    assert!(waited < Duration::from_millis(300), "read waited {waited:?}");
    assert_eq!(sequences(&events), vec![1]);
    assert_eq!(Value::Object(snapshot), json!({"name": "Jo", "version": 1}));

    assert_eq!(writer.await.unwrap().unwrap().sequence.value(), 2);
    assert_eq!(sequences(&log.get_events("p1", None).await.unwrap()), vec![1, 2]);
}

#[tokio::test]
async fn cleared_store_starts_over_at_one() {
    let (log, store) = event_log();
    log.append("patient", "p1", "PatientRegistered", json!({}), None)
        .await
        .unwrap();
    store.clear();

    let event = log
        .append("patient", "p1", "PatientRegistered", json!({}), None)
        .await
        .unwrap();
    assert!(event.sequence.is_first());
}

#[derive(Clone, Debug)]
enum PatientOp {
    Update(String, i64),
    Archive,
}

fn patient_op() -> impl Strategy<Value = PatientOp> {
    prop_oneof![
        4 => ("[a-z]{1,3}", any::<i64>()).prop_map(|(k, v)| PatientOp::Update(k, v)),
        1 => Just(PatientOp::Archive),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn fold_matches_materialised_read_model(ops in prop::collection::vec(patient_op(), 0..15)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (log, _store) = event_log();
            log.append("patient", "prop-1", "PatientRegistered", json!({"name": "Jo"}), None)
                .await
                .unwrap();
            for op in &ops {
                let (event_type, data) = match op {
                    PatientOp::Update(key, value) => {
                        let mut updates = serde_json::Map::new();
                        updates.insert(key.clone(), Value::from(*value));
                        ("PatientUpdated", json!({ "updates": updates }))
                    },
                    PatientOp::Archive => ("PatientArchived", json!({})),
                };
                log.append("patient", "prop-1", event_type, data, None).await.unwrap();
            }

            let events = log.get_events("prop-1", None).await.unwrap();
            let expected: Vec<u64> = (1..=events.len() as u64).collect();
            assert_eq!(sequences(&events), expected);
            assert_eq!(events.len(), ops.len() + 1);
            log.verify_projection("prop-1").await.unwrap();
        });
    }
}
