//! Read-model tables and the [`ReadModelTx`] bound to an append transaction.
//!
//! The free `fetch_*` functions take any `&mut PgConnection`, so the same
//! row codecs serve the locked reads of an append and the plain reads of
//! `load_read_model`.

use chartlog_core::event::{EventKind, Payload};
use chartlog_core::projection::security::AccessAction;
use chartlog_core::projection::{
    AccessLogEntry, ClinicalEntry, LabView, PatientStatus, PatientView, ProjectionError,
    ProviderDetails, ReadModelTx, SymptomsSummary, TxFuture,
};
use chartlog_core::stream::{AggregateId, Sequence};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, Row, Transaction};

type Result<T> = std::result::Result<T, ProjectionError>;

fn storage(error: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage(error.to_string())
}

fn corrupt(column: &str, message: impl std::fmt::Display) -> ProjectionError {
    ProjectionError::Serialization(format!("column {column}: {message}"))
}

fn id_column(row: &PgRow, column: &str) -> Result<AggregateId> {
    let raw: String = row.try_get(column).map_err(storage)?;
    AggregateId::parse(&raw).map_err(|e| corrupt(column, e.reason()))
}

fn sequence_column(row: &PgRow, column: &str) -> Result<Sequence> {
    let raw: i64 = row.try_get(column).map_err(storage)?;
    Sequence::try_from(raw).map_err(|e| corrupt(column, e))
}

fn version_column(row: &PgRow, column: &str) -> Result<u64> {
    let raw: i64 = row.try_get(column).map_err(storage)?;
    u64::try_from(raw).map_err(|e| corrupt(column, e))
}

fn version_param(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|e| corrupt("version", e))
}

fn payload_column(row: &PgRow, column: &str) -> Result<Payload> {
    let Json(payload): Json<Payload> = row.try_get(column).map_err(storage)?;
    Ok(payload)
}

fn kind_column(row: &PgRow, column: &str) -> Result<EventKind> {
    let raw: String = row.try_get(column).map_err(storage)?;
    raw.parse().map_err(|e| corrupt(column, e))
}

fn patient_from_row(row: &PgRow) -> Result<PatientView> {
    let status = match row.try_get::<String, _>("status").map_err(storage)?.as_str() {
        "active" => PatientStatus::Active,
        "archived" => PatientStatus::Archived,
        other => return Err(corrupt("status", format!("unknown status {other:?}"))),
    };
    Ok(PatientView {
        aggregate_id: id_column(row, "aggregate_id")?,
        data: payload_column(row, "data")?,
        status,
        archive_reason: row.try_get("archive_reason").map_err(storage)?,
        version: version_column(row, "version")?,
        registered_at: row.try_get("registered_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
        last_event_id: row.try_get("last_event_id").map_err(storage)?,
    })
}

fn clinical_from_row(row: &PgRow) -> Result<ClinicalEntry> {
    let symptoms: Option<Json<SymptomsSummary>> =
        row.try_get("symptoms_summary").map_err(storage)?;
    let provider: Option<Json<ProviderDetails>> =
        row.try_get("provider_details").map_err(storage)?;
    Ok(ClinicalEntry {
        event_id: row.try_get("event_id").map_err(storage)?,
        aggregate_id: id_column(row, "aggregate_id")?,
        sequence: sequence_column(row, "sequence")?,
        entry_type: kind_column(row, "entry_type")?,
        data: payload_column(row, "data")?,
        symptoms_summary: symptoms.map(|Json(summary)| summary),
        provider_details: provider.map(|Json(details)| details),
        recorded_at: row.try_get("recorded_at").map_err(storage)?,
    })
}

fn lab_from_row(row: &PgRow) -> Result<LabView> {
    Ok(LabView {
        result_id: id_column(row, "result_id")?,
        aggregate_id: id_column(row, "aggregate_id")?,
        results: payload_column(row, "results")?,
        version: version_column(row, "version")?,
        recorded_at: row.try_get("recorded_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn access_from_row(row: &PgRow) -> Result<AccessLogEntry> {
    let action = match row.try_get::<String, _>("action").map_err(storage)?.as_str() {
        "granted" => AccessAction::Granted,
        "revoked" => AccessAction::Revoked,
        "denied" => AccessAction::Denied,
        other => return Err(corrupt("action", format!("unknown action {other:?}"))),
    };
    Ok(AccessLogEntry {
        event_id: row.try_get("event_id").map_err(storage)?,
        aggregate_id: id_column(row, "aggregate_id")?,
        sequence: sequence_column(row, "sequence")?,
        action,
        actor: row.try_get("actor").map_err(storage)?,
        resource: row.try_get("resource").map_err(storage)?,
        details: payload_column(row, "details")?,
        recorded_at: row.try_get("recorded_at").map_err(storage)?,
    })
}

const fn action_name(action: AccessAction) -> &'static str {
    match action {
        AccessAction::Granted => "granted",
        AccessAction::Revoked => "revoked",
        AccessAction::Denied => "denied",
    }
}

const PATIENT_COLUMNS: &str = "aggregate_id, data, status, archive_reason, version, \
     registered_at, updated_at, last_event_id";
const CLINICAL_COLUMNS: &str = "event_id, aggregate_id, sequence, entry_type, data, \
     symptoms_summary, provider_details, recorded_at";
const LAB_COLUMNS: &str = "result_id, aggregate_id, results, version, recorded_at, updated_at";
const ACCESS_COLUMNS: &str =
    "event_id, aggregate_id, sequence, action, actor, resource, details, recorded_at";

/// Patient row, optionally locked until the surrounding transaction ends.
pub(crate) async fn fetch_patient(
    conn: &mut PgConnection,
    aggregate_id: &AggregateId,
    lock: bool,
) -> Result<Option<PatientView>> {
    let sql = format!(
        "SELECT {PATIENT_COLUMNS} FROM patient_views WHERE aggregate_id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(aggregate_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    row.as_ref().map(patient_from_row).transpose()
}

/// Every clinical entry of an episode, ordered by sequence.
pub(crate) async fn fetch_clinical_entries(
    conn: &mut PgConnection,
    aggregate_id: &AggregateId,
) -> Result<Vec<ClinicalEntry>> {
    let sql = format!(
        "SELECT {CLINICAL_COLUMNS} FROM clinical_entries WHERE aggregate_id = $1 ORDER BY sequence"
    );
    let rows = sqlx::query(&sql)
        .bind(aggregate_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(storage)?;
    rows.iter().map(clinical_from_row).collect()
}

async fn fetch_last_clinical_entry(
    conn: &mut PgConnection,
    aggregate_id: &AggregateId,
) -> Result<Option<ClinicalEntry>> {
    let sql = format!(
        "SELECT {CLINICAL_COLUMNS} FROM clinical_entries WHERE aggregate_id = $1 \
         ORDER BY sequence DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(aggregate_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    row.as_ref().map(clinical_from_row).transpose()
}

/// Lab row by result id, optionally locked until the surrounding transaction ends.
pub(crate) async fn fetch_lab(
    conn: &mut PgConnection,
    result_id: &AggregateId,
    lock: bool,
) -> Result<Option<LabView>> {
    let sql = format!(
        "SELECT {LAB_COLUMNS} FROM lab_views WHERE result_id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(result_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    row.as_ref().map(lab_from_row).transpose()
}

/// Every access-log row of a principal, ordered by sequence.
pub(crate) async fn fetch_access_log(
    conn: &mut PgConnection,
    aggregate_id: &AggregateId,
) -> Result<Vec<AccessLogEntry>> {
    let sql =
        format!("SELECT {ACCESS_COLUMNS} FROM access_log WHERE aggregate_id = $1 ORDER BY sequence");
    let rows = sqlx::query(&sql)
        .bind(aggregate_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(storage)?;
    rows.iter().map(access_from_row).collect()
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn insert_error(error: sqlx::Error, entry_type: EventKind, row: String) -> ProjectionError {
    if is_unique_violation(&error) {
        ProjectionError::RowExists {
            event_type: entry_type,
            row,
        }
    } else {
        storage(error)
    }
}

/// [`ReadModelTx`] writing through the append's open transaction.
///
/// Rows outside the aggregate being appended are refused, matching the
/// one-aggregate-per-append scope of the event itself.
pub struct PgReadModelTx<'t> {
    tx: &'t mut Transaction<'static, Postgres>,
    aggregate_id: &'t AggregateId,
}

impl<'t> PgReadModelTx<'t> {
    /// Bind read-model access to `tx` for an append to `aggregate_id`.
    pub fn new(tx: &'t mut Transaction<'static, Postgres>, aggregate_id: &'t AggregateId) -> Self {
        Self { tx, aggregate_id }
    }

    fn check_row(&self, row: &AggregateId) -> Result<()> {
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

impl ReadModelTx for PgReadModelTx<'_> {
    fn load_patient(&mut self, aggregate_id: AggregateId) -> TxFuture<'_, Option<PatientView>> {
        Box::pin(async move {
            self.check_row(&aggregate_id)?;
            fetch_patient(&mut **self.tx, &aggregate_id, true).await
        })
    }

    fn save_patient(&mut self, view: PatientView) -> TxFuture<'_, ()> {
        Box::pin(async move {
            self.check_row(&view.aggregate_id)?;
            sqlx::query(
                r"
                INSERT INTO patient_views (
                    aggregate_id, data, status, archive_reason, version,
                    registered_at, updated_at, last_event_id
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (aggregate_id) DO UPDATE SET
                    data = EXCLUDED.data,
                    status = EXCLUDED.status,
                    archive_reason = EXCLUDED.archive_reason,
                    version = EXCLUDED.version,
                    updated_at = EXCLUDED.updated_at,
                    last_event_id = EXCLUDED.last_event_id
                ",
            )
            .bind(view.aggregate_id.as_str())
            .bind(Json(&view.data))
            .bind(view.status.as_str())
            .bind(view.archive_reason.as_deref())
            .bind(version_param(view.version)?)
            .bind(view.registered_at)
            .bind(view.updated_at)
            .bind(view.last_event_id)
            .execute(&mut **self.tx)
            .await
            .map_err(storage)?;
            Ok(())
        })
    }

    fn last_clinical_entry(
        &mut self,
        aggregate_id: AggregateId,
    ) -> TxFuture<'_, Option<ClinicalEntry>> {
        Box::pin(async move {
            self.check_row(&aggregate_id)?;
            fetch_last_clinical_entry(&mut **self.tx, &aggregate_id).await
        })
    }

    fn insert_clinical_entry(&mut self, entry: ClinicalEntry) -> TxFuture<'_, ()> {
        Box::pin(async move {
            self.check_row(&entry.aggregate_id)?;
            sqlx::query(
                r"
                INSERT INTO clinical_entries (
                    event_id, aggregate_id, sequence, entry_type, data,
                    symptoms_summary, provider_details, recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(entry.event_id)
            .bind(entry.aggregate_id.as_str())
            .bind(entry.sequence.as_i64())
            .bind(entry.entry_type.as_str())
            .bind(Json(&entry.data))
            .bind(entry.symptoms_summary.as_ref().map(Json))
            .bind(entry.provider_details.as_ref().map(Json))
            .bind(entry.recorded_at)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| insert_error(e, entry.entry_type, entry.event_id.to_string()))?;
            Ok(())
        })
    }

    fn load_lab(&mut self, result_id: AggregateId) -> TxFuture<'_, Option<LabView>> {
        Box::pin(async move {
            self.check_row(&result_id)?;
            fetch_lab(&mut **self.tx, &result_id, true).await
        })
    }

    fn save_lab(&mut self, view: LabView) -> TxFuture<'_, ()> {
        Box::pin(async move {
            self.check_row(&view.result_id)?;
            sqlx::query(
                r"
                INSERT INTO lab_views (
                    result_id, aggregate_id, results, version, recorded_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (result_id) DO UPDATE SET
                    results = EXCLUDED.results,
                    version = EXCLUDED.version,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(view.result_id.as_str())
            .bind(view.aggregate_id.as_str())
            .bind(Json(&view.results))
            .bind(version_param(view.version)?)
            .bind(view.recorded_at)
            .bind(view.updated_at)
            .execute(&mut **self.tx)
            .await
            .map_err(storage)?;
            Ok(())
        })
    }

    fn insert_access_entry(&mut self, entry: AccessLogEntry) -> TxFuture<'_, ()> {
        Box::pin(async move {
            self.check_row(&entry.aggregate_id)?;
            let event_type = match entry.action {
                AccessAction::Granted => EventKind::AccessGranted,
                AccessAction::Revoked => EventKind::AccessRevoked,
                AccessAction::Denied => EventKind::AccessDenied,
            };
            sqlx::query(
                r"
                INSERT INTO access_log (
                    event_id, aggregate_id, sequence, action, actor,
                    resource, details, recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(entry.event_id)
            .bind(entry.aggregate_id.as_str())
            .bind(entry.sequence.as_i64())
            .bind(action_name(entry.action))
            .bind(entry.actor.as_deref())
            .bind(&entry.resource)
            .bind(Json(&entry.details))
            .bind(entry.recorded_at)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| insert_error(e, event_type, entry.event_id.to_string()))?;
            Ok(())
        })
    }
}
