//! Persistence layer: transactional storage of records, record versions,
//! encryption keys, audit events, and the singleton system parameters.
//!
//! All write paths live on [`Session`], a transaction-scoped handle. Callers
//! either open a fresh session (one transaction per logical operation) or
//! join an existing one so that nested operations share atomicity. Within a
//! session the entity mutation always precedes its audit insert; both commit
//! together or not at all.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::models::{EncryptionKeyState, SystemEventType};

mod keys;
mod records;
mod system;

/// Connect options for a file-backed SQLite database with referential
/// integrity enforcement on, suitable for passing to [`Connection::connect`].
pub fn sqlite_options(db_file: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_file)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Prevent transient "database is locked" errors under concurrent access.
        .busy_timeout(Duration::from_secs(5))
}

/// Manages connections and transactions with the database
#[derive(Clone)]
pub struct Connection {
    pool: SqlitePool,
}

impl Connection {
    /// Open a connection pool with the given options
    pub async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Begin a new session (one database transaction)
    pub async fn begin(&self) -> Result<Session<'static>> {
        let tx = self.pool.begin().await?;
        Ok(Session { tx })
    }

    /// Create the backing tables when absent.
    ///
    /// Record versions cascade away with their parent record and with the
    /// encryption key that sealed them.
    pub async fn define_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS encryption_keys (
                id TEXT PRIMARY KEY,
                enc_key_material BLOB NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS record_versions (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL REFERENCES records (id) ON DELETE CASCADE,
                enc_key_id TEXT NOT NULL REFERENCES encryption_keys (id) ON DELETE CASCADE,
                enc_value BLOB NOT NULL,
                enc_nonce BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS system_audit_events (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS system_params (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("backing tables ready");
        Ok(())
    }
}

/// A session-scoped handle: one open database transaction wrapping one
/// logical operation.
///
/// Dropping a session without [`Session::commit`] rolls the transaction
/// back, discarding every entity mutation and audit event made through it.
pub struct Session<'c> {
    tx: Transaction<'c, Sqlite>,
}

impl Session<'_> {
    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Listing filters
// ============================================================================

/// Audit event query filter conditions
#[derive(Debug, Clone, Default)]
pub struct SystemEventFilter {
    /// The specific event types to query for; empty means all
    pub event_types: Vec<SystemEventType>,
    /// Filter for events at or after this timestamp
    pub events_after: Option<DateTime<Utc>>,
    /// Filter for events at or before this timestamp
    pub events_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Encryption key query filter conditions
#[derive(Debug, Clone, Default)]
pub struct EncryptionKeyFilter {
    /// The specific states to query for; empty means all
    pub target_states: Vec<EncryptionKeyState>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Data record query filter conditions
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Data record version query filter conditions
#[derive(Debug, Clone, Default)]
pub struct RecordVersionFilter {
    /// Fetch only record versions related to this record
    pub target_record_id: Option<String>,
    /// Fetch versions related to this encryption key
    pub target_enc_key_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Append LIMIT/OFFSET clauses to a listing query.
///
/// SQLite requires a LIMIT before OFFSET; `LIMIT -1` means unbounded.
pub(crate) fn push_paging(
    builder: &mut QueryBuilder<'_, Sqlite>,
    limit: Option<i64>,
    offset: Option<i64>,
) {
    match (limit, offset) {
        (Some(limit), Some(offset)) => {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }
        (Some(limit), None) => {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
        (None, Some(offset)) => {
            builder.push(" LIMIT -1 OFFSET ");
            builder.push_bind(offset);
        }
        (None, None) => {}
    }
}
