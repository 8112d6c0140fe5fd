//! [`EventStore`] backed by `PostgreSQL`.

use crate::config::PostgresConfig;
use crate::read_models::{
    PgReadModelTx, fetch_access_log, fetch_clinical_entries, fetch_lab, fetch_patient,
    is_unique_violation,
};
use chartlog_core::event::{AggregateType, EventRecord, Payload};
use chartlog_core::event_store::{EventStore, EventStoreError, StoreFuture};
use chartlog_core::handler::Dispatcher;
use chartlog_core::projection::{AccessLog, ClinicalRecord, ProjectionError, ReadModel};
use chartlog_core::sequence::SequenceAllocator;
use chartlog_core::stream::{AggregateId, Sequence};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use std::str::FromStr;

fn database(error: sqlx::Error) -> EventStoreError {
    EventStoreError::DatabaseError(error.to_string())
}

fn corrupt(column: &str, message: impl std::fmt::Display) -> EventStoreError {
    EventStoreError::SerializationError(format!("column {column}: {message}"))
}

fn read_model_error(error: ProjectionError) -> EventStoreError {
    match error {
        ProjectionError::Serialization(message) => EventStoreError::SerializationError(message),
        other => EventStoreError::DatabaseError(other.to_string()),
    }
}

fn event_from_row(row: &PgRow) -> Result<EventRecord, EventStoreError> {
    let aggregate_type: String = row.try_get("aggregate_type").map_err(database)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(database)?;
    let event_type: String = row.try_get("event_type").map_err(database)?;
    let sequence: i64 = row.try_get("sequence").map_err(database)?;
    let Json(event_data): Json<Payload> = row.try_get("event_data").map_err(database)?;
    let Json(metadata): Json<Payload> = row.try_get("metadata").map_err(database)?;

    Ok(EventRecord {
        id: row.try_get("id").map_err(database)?,
        aggregate_type: aggregate_type
            .parse()
            .map_err(|e| corrupt("aggregate_type", e))?,
        aggregate_id: AggregateId::parse(&aggregate_id)
            .map_err(|e| corrupt("aggregate_id", e.reason()))?,
        event_type: event_type.parse().map_err(|e| corrupt("event_type", e))?,
        event_data,
        metadata,
        sequence: Sequence::try_from(sequence).map_err(|e| corrupt("sequence", e))?,
        timestamp: row.try_get("timestamp").map_err(database)?,
    })
}

/// Aggregate type an id was first appended under, if any.
async fn owner_of(
    conn: &mut PgConnection,
    aggregate_id: &AggregateId,
) -> Result<Option<AggregateType>, EventStoreError> {
    let owner: Option<String> =
        sqlx::query_scalar("SELECT aggregate_type FROM aggregates WHERE aggregate_id = $1")
            .bind(aggregate_id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(database)?;
    owner
        .map(|owner| owner.parse().map_err(|e| corrupt("aggregate_type", e)))
        .transpose()
}

/// `PostgreSQL` event store.
///
/// Each commit runs in one transaction: the `aggregates` row of the stream is
/// locked, the claimed sequence is checked against it, the event is inserted
/// and the handler projects it through a [`PgReadModelTx`] on the same
/// transaction. Any error, or dropping the future, rolls everything back.
///
/// The `UNIQUE (aggregate_type, aggregate_id, sequence)` constraint on
/// `events` is the final arbiter: a duplicate insert is reported as
/// [`EventStoreError::SequenceConflict`].
///
/// # Example
///
/// ```no_run
/// use chartlog_postgres::{PostgresConfig, PostgresEventStore};
///
/// # async fn example() -> Result<(), chartlog_core::event_store::EventStoreError> {
/// let store = PostgresEventStore::connect(&PostgresConfig::new("postgres://localhost/chartlog")).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Open a connection pool according to `config`.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`] if the url is malformed or the
    /// database cannot be reached.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, EventStoreError> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| EventStoreError::DatabaseError(format!("Invalid database url: {e}")))?
            .options([(
                "statement_timeout",
                format!("{}ms", config.statement_timeout_ms()),
            )]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL event store"
        );
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn commit_in_transaction(
        &self,
        event: &EventRecord,
        dispatcher: &Dispatcher,
    ) -> Result<(), EventStoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        sqlx::query(
            r"
            INSERT INTO aggregates (aggregate_id, aggregate_type)
            VALUES ($1, $2)
            ON CONFLICT (aggregate_id) DO NOTHING
            ",
        )
        .bind(event.aggregate_id.as_str())
        .bind(event.aggregate_type.as_str())
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        // Serialises appends to one aggregate until commit or rollback.
        let stream = sqlx::query(
            "SELECT aggregate_type, last_sequence FROM aggregates WHERE aggregate_id = $1 FOR UPDATE",
        )
        .bind(event.aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(database)?;

        let owner: AggregateType = stream
            .try_get::<String, _>("aggregate_type")
            .map_err(database)?
            .parse()
            .map_err(|e| corrupt("aggregate_type", e))?;
        if owner != event.aggregate_type {
            return Err(EventStoreError::validation(
                "aggregate_id",
                format!(
                    "aggregate {} belongs to aggregate type {owner}, not {}",
                    event.aggregate_id, event.aggregate_type
                ),
            ));
        }
        let last: i64 = stream.try_get("last_sequence").map_err(database)?;
        let current = if last == 0 {
            None
        } else {
            Some(Sequence::try_from(last).map_err(|e| corrupt("last_sequence", e))?)
        };
        SequenceAllocator::guard(
            event.aggregate_type,
            &event.aggregate_id,
            current,
            event.sequence,
        )?;

        sqlx::query(
            r"
            INSERT INTO events (
                id, aggregate_type, aggregate_id, event_type,
                event_data, metadata, sequence, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(event.id)
        .bind(event.aggregate_type.as_str())
        .bind(event.aggregate_id.as_str())
        .bind(event.event_type.as_str())
        .bind(Json(&event.event_data))
        .bind(Json(&event.metadata))
        .bind(event.sequence.as_i64())
        .bind(event.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::SequenceConflict {
                    aggregate_type: event.aggregate_type,
                    aggregate_id: event.aggregate_id.clone(),
                    sequence: event.sequence,
                }
            } else {
                database(e)
            }
        })?;

        sqlx::query("UPDATE aggregates SET last_sequence = $2 WHERE aggregate_id = $1")
            .bind(event.aggregate_id.as_str())
            .bind(event.sequence.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(database)?;

        {
            let mut read_models = PgReadModelTx::new(&mut tx, &event.aggregate_id);
            dispatcher.dispatch(event, &mut read_models).await?;
        }

        tx.commit().await.map_err(database)
    }
}

impl EventStore for PostgresEventStore {
    fn current_sequence(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> StoreFuture<'_, Option<Sequence>> {
        Box::pin(async move {
            let max: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(sequence) FROM events WHERE aggregate_type = $1 AND aggregate_id = $2",
            )
            .bind(aggregate_type.as_str())
            .bind(aggregate_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(database)?;

            max.map(|max| Sequence::try_from(max).map_err(|e| corrupt("sequence", e)))
                .transpose()
        })
    }

    fn commit<'a>(
        &'a self,
        event: EventRecord,
        dispatcher: &'a Dispatcher,
    ) -> StoreFuture<'a, EventRecord> {
        Box::pin(async move {
            match self.commit_in_transaction(&event, dispatcher).await {
                Ok(()) => {
                    tracing::debug!(
                        aggregate_type = %event.aggregate_type,
                        aggregate_id = %event.aggregate_id,
                        sequence = event.sequence.value(),
                        "Event committed"
                    );
                    Ok(event)
                },
                Err(error) => {
                    tracing::warn!(
                        aggregate_type = %event.aggregate_type,
                        aggregate_id = %event.aggregate_id,
                        sequence = event.sequence.value(),
                        error = %error,
                        "Append transaction rolled back"
                    );
                    metrics::counter!(
                        "chartlog_pg_rollbacks_total",
                        "reason" => error.label()
                    )
                    .increment(1);
                    Err(error)
                },
            }
        })
    }

    fn load_events(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Vec<EventRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, aggregate_type, aggregate_id, event_type,
                       event_data, metadata, sequence, timestamp
                FROM events
                WHERE aggregate_id = $1
                ORDER BY sequence ASC
                ",
            )
            .bind(aggregate_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;

            rows.iter().map(event_from_row).collect()
        })
    }

    fn load_read_model(&self, aggregate_id: AggregateId) -> StoreFuture<'_, Option<ReadModel>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(database)?;
            let Some(owner) = owner_of(&mut conn, &aggregate_id).await? else {
                return Ok(None);
            };

            let model = match owner {
                AggregateType::Patient => fetch_patient(&mut conn, &aggregate_id, false)
                    .await
                    .map_err(read_model_error)?
                    .map(ReadModel::Patient),
                AggregateType::Clinical => {
                    let entries = fetch_clinical_entries(&mut conn, &aggregate_id)
                        .await
                        .map_err(read_model_error)?;
                    (!entries.is_empty()).then(|| {
                        ReadModel::Clinical(ClinicalRecord {
                            aggregate_id: aggregate_id.clone(),
                            entries,
                        })
                    })
                },
                AggregateType::Lab => fetch_lab(&mut conn, &aggregate_id, false)
                    .await
                    .map_err(read_model_error)?
                    .map(ReadModel::Lab),
                AggregateType::Security => {
                    let entries = fetch_access_log(&mut conn, &aggregate_id)
                        .await
                        .map_err(read_model_error)?;
                    (!entries.is_empty()).then(|| {
                        ReadModel::Security(AccessLog {
                            aggregate_id: aggregate_id.clone(),
                            entries,
                        })
                    })
                },
            };
            Ok(model)
        })
    }
}
