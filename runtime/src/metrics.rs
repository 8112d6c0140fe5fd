//! Prometheus metrics for the event log.
//!
//! Metric names:
//!
//! - `chartlog_appends_total` (labels `aggregate_type`, `event_type`)
//! - `chartlog_append_conflicts_total` (label `aggregate_type`)
//! - `chartlog_append_rejections_total` (label `reason`)
//! - `chartlog_append_duration_seconds`
//! - `chartlog_replays_total` (label `outcome`)
//! - `chartlog_pg_rollbacks_total` (label `reason`), recorded by `chartlog-postgres`
//!
//! # Example
//!
//! ```rust,no_run
//! use chartlog_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use chartlog_core::event::{AggregateType, EventKind};
use chartlog_core::event_store::EventStoreError;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter for the event log's metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr` (e.g. `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder that is already installed (e.g. by another test) is not an
    /// error; metrics keep flowing to it and [`MetricsServer::render`] returns
    /// `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Address the exporter was configured for.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every metric the event log emits.
///
/// Safe to call more than once.
pub fn register_metrics() {
    describe_counter!(
        "chartlog_appends_total",
        "Total number of events committed to the log"
    );
    describe_counter!(
        "chartlog_append_conflicts_total",
        "Total number of append attempts that lost a sequence race"
    );
    describe_counter!(
        "chartlog_append_rejections_total",
        "Total number of appends rejected with a terminal error"
    );
    describe_histogram!(
        "chartlog_append_duration_seconds",
        "Time to commit an append, retries included"
    );
    describe_counter!(
        "chartlog_replays_total",
        "Total number of history folds"
    );
    describe_counter!(
        "chartlog_pg_rollbacks_total",
        "Append transactions rolled back by the PostgreSQL store, by reason"
    );
}

/// Event log metrics recorder.
pub struct EventLogMetrics;

impl EventLogMetrics {
    /// Record a committed append.
    pub fn record_append(aggregate_type: AggregateType, event_type: EventKind, duration: Duration) {
        counter!(
            "chartlog_appends_total",
            "aggregate_type" => aggregate_type.as_str(),
            "event_type" => event_type.as_str()
        )
        .increment(1);
        histogram!("chartlog_append_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a lost sequence race.
    pub fn record_conflict(aggregate_type: AggregateType) {
        counter!(
            "chartlog_append_conflicts_total",
            "aggregate_type" => aggregate_type.as_str()
        )
        .increment(1);
    }

    /// Record an append that failed for good.
    pub fn record_rejection(error: &EventStoreError) {
        counter!("chartlog_append_rejections_total", "reason" => error.label()).increment(1);
    }

    /// Record a fold, successful or not.
    pub fn record_replay(ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        counter!("chartlog_replays_total", "outcome" => outcome).increment(1);
    }
}
