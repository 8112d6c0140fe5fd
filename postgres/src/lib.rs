//! `PostgreSQL` backend for the chartlog event log.
//!
//! Implements the storage traits of `chartlog-core` on top of `sqlx`:
//!
//! - [`PostgresEventStore`]: events plus read models, one transaction per append
//! - [`PgReadModelTx`]: the handler-facing view of that transaction
//! - [`PostgresAuditTrail`]: append-only audit entries
//!
//! The schema lives in `migrations/` and is applied with
//! [`PostgresEventStore::migrate`].
//!
//! # Example
//!
//! ```no_run
//! use chartlog_postgres::{PostgresConfig, PostgresEventStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PostgresConfig::from_env()?;
//! let store = PostgresEventStore::connect(&config).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod read_models;
pub mod store;

pub use audit::PostgresAuditTrail;
pub use config::{ConfigError, PostgresConfig};
pub use read_models::PgReadModelTx;
pub use store::PostgresEventStore;
