//! [`AuditTrail`] backed by the `audit_trail` table.

use chartlog_core::audit::{AuditAction, AuditEntry, AuditError, AuditFuture, AuditTrail, EntityRef};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;

fn database(error: sqlx::Error) -> AuditError {
    AuditError::DatabaseError(error.to_string())
}

fn entry_from_row(row: &PgRow) -> Result<AuditEntry, AuditError> {
    let kind: String = row.try_get("entity_kind").map_err(database)?;
    let id: String = row.try_get("entity_id").map_err(database)?;
    let action: String = row.try_get("action").map_err(database)?;
    let Json(previous_values): Json<Value> = row.try_get("previous_values").map_err(database)?;
    let Json(new_values): Json<Value> = row.try_get("new_values").map_err(database)?;

    Ok(AuditEntry {
        id: row.try_get("id").map_err(database)?,
        entity: EntityRef::from_parts(&kind, &id)?,
        action: AuditAction::parse(&action)
            .ok_or_else(|| AuditError::Invalid(format!("unknown audit action {action:?}")))?,
        actor: row.try_get("actor").map_err(database)?,
        previous_values,
        new_values,
        recorded_at: row.try_get("recorded_at").map_err(database)?,
    })
}

/// Append-only audit trail in `PostgreSQL`.
///
/// Shares the event store's pool; entries are never updated or deleted.
#[derive(Clone, Debug)]
pub struct PostgresAuditTrail {
    pool: PgPool,
}

impl PostgresAuditTrail {
    /// Create an audit trail over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AuditTrail for PostgresAuditTrail {
    fn record(&self, entry: AuditEntry) -> AuditFuture<'_, ()> {
        Box::pin(async move {
            if entry.actor.trim().is_empty() {
                return Err(AuditError::Invalid("actor cannot be empty".to_string()));
            }
            sqlx::query(
                r"
                INSERT INTO audit_trail (
                    id, entity_kind, entity_id, action, actor,
                    previous_values, new_values, recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(entry.id)
            .bind(entry.entity.kind())
            .bind(entry.entity.id())
            .bind(entry.action.as_str())
            .bind(&entry.actor)
            .bind(Json(&entry.previous_values))
            .bind(Json(&entry.new_values))
            .bind(entry.recorded_at)
            .execute(&self.pool)
            .await
            .map_err(database)?;

            tracing::info!(
                entity = %entry.entity,
                action = entry.action.as_str(),
                actor = %entry.actor,
                "Audit entry recorded"
            );
            Ok(())
        })
    }

    fn history(&self, entity: EntityRef) -> AuditFuture<'_, Vec<AuditEntry>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, entity_kind, entity_id, action, actor,
                       previous_values, new_values, recorded_at
                FROM audit_trail
                WHERE entity_kind = $1 AND entity_id = $2
                ORDER BY recorded_at ASC, position ASC
                ",
            )
            .bind(entity.kind())
            .bind(entity.id())
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;

            rows.iter().map(entry_from_row).collect()
        })
    }
}
