//! SQLite-backed warehouse safety store.
//!
//! One [`SqliteWarehouse`] owns the connection and exposes the sync state
//! tracker, the quarantine store, the audit trail, and the read-only query
//! gate as method families on itself. All timestamps are stored as UTC
//! RFC 3339 text truncated to whole seconds, so lexicographic comparison in
//! SQL matches chronological order.

mod audit;
mod gate;
mod quarantine;
mod sync;

pub use gate::{QueryContext, QueryRow, GATE_ACTOR, GATE_TENANT};

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags};
use ulid::Ulid;

use etlguard_core::{format_rfc3339, now_utc, CoreError};

/// Errors surfaced by warehouse store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sync already running for {sync_source}/{entity}")]
    SyncInProgress { sync_source: String, entity: String },
    #[error("no sync state for {sync_source}/{entity}")]
    SyncStateNotFound { sync_source: String, entity: String },
    #[error("quarantine record {record_id} has exhausted its retries")]
    MaxRetriesExceeded { record_id: Ulid },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

const MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS etl_state (
    state_id TEXT PRIMARY KEY,
    source TEXT NOT NULL CHECK (length(source) > 0),
    entity TEXT NOT NULL CHECK (length(entity) > 0),
    cursor_value TEXT,
    cursor_kind TEXT CHECK (cursor_kind IS NULL OR cursor_kind IN ('change_marker', 'high_water_mark', 'offset')),
    last_sync_at TEXT,
    records_synced INTEGER NOT NULL DEFAULT 0 CHECK (records_synced >= 0),
    sync_status TEXT NOT NULL DEFAULT 'idle' CHECK (sync_status IN ('idle', 'running', 'completed', 'failed')),
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (source, entity)
);

CREATE INDEX IF NOT EXISTS idx_etl_state_status ON etl_state (sync_status, updated_at);

CREATE TABLE IF NOT EXISTS etl_quarantine (
    record_id TEXT PRIMARY KEY,
    batch_id TEXT,
    source TEXT NOT NULL CHECK (length(source) > 0),
    source_table TEXT,
    source_id TEXT,
    raw_data TEXT NOT NULL DEFAULT 'null',
    error_reason TEXT NOT NULL CHECK (length(error_reason) > 0),
    error_code TEXT,
    validation_rules_failed TEXT NOT NULL DEFAULT '[]',
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    max_retries INTEGER NOT NULL CHECK (max_retries > 0),
    last_retry_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'retrying', 'resolved', 'ignored')),
    resolved_by TEXT,
    resolved_at TEXT,
    resolution_notes TEXT,
    created_at TEXT NOT NULL,
    CHECK (retry_count <= max_retries)
);

CREATE INDEX IF NOT EXISTS idx_quarantine_source_status ON etl_quarantine (source, status, created_at);
CREATE INDEX IF NOT EXISTS idx_quarantine_error_code ON etl_quarantine (error_code);

CREATE TABLE IF NOT EXISTS audit_logs (
    entry_id TEXT PRIMARY KEY,
    actor_id TEXT NOT NULL CHECK (length(actor_id) > 0),
    tenant_id TEXT NOT NULL CHECK (length(tenant_id) > 0),
    session_id TEXT,
    action TEXT NOT NULL CHECK (action IN (
        'query_submit', 'sql_execute', 'query_error',
        'sync_start', 'sync_complete', 'sync_fail', 'sync_reset',
        'record_quarantined', 'quarantine_resolve',
        'approval_gate', 'document_action', 'data_access'
    )),
    resource_type TEXT,
    resource_id TEXT,
    status TEXT NOT NULL CHECK (status IN ('success', 'failure', 'pending')),
    ip_address TEXT,
    user_agent TEXT,
    request_id TEXT,
    details TEXT NOT NULL DEFAULT '{}',
    error_message TEXT,
    duration_ms INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_logs (actor_id, created_at);
CREATE INDEX IF NOT EXISTS idx_audit_tenant ON audit_logs (tenant_id, created_at);

CREATE TRIGGER IF NOT EXISTS audit_logs_no_update
BEFORE UPDATE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_logs_no_delete
BEFORE DELETE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;

CREATE TABLE IF NOT EXISTS warehouse_records (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL CHECK (length(source) > 0),
    source_id TEXT NOT NULL CHECK (length(source_id) > 0),
    entity TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (source, source_id)
);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
";

/// Warehouse safety store over a single SQLite connection.
pub struct SqliteWarehouse {
    conn: Connection,
}

impl SqliteWarehouse {
    /// Opens (creating if needed) the database at `path` and applies
    /// migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    /// Opens an in-memory database, mainly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA_V1)?;
        let applied = fmt_now()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![MIGRATION_VERSION, applied],
        )?;
        Ok(())
    }

    /// Idempotent landing-zone upsert keyed on `(source, source_id)`.
    ///
    /// Replaying a batch overwrites the payload in place instead of creating
    /// duplicates. Returns the stable row id.
    pub fn upsert_source_record(
        &self,
        source: &str,
        source_id: &str,
        entity: &str,
        payload: &serde_json::Value,
    ) -> Result<String, StoreError> {
        if source.is_empty() || source_id.is_empty() {
            return Err(CoreError::Validation(
                "source and source_id are required".to_owned(),
            )
            .into());
        }
        let body = serde_json::to_string(payload)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let now = fmt_now()?;
        let id: String = self.conn.query_row(
            "INSERT INTO warehouse_records (id, source, source_id, entity, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (source, source_id) DO UPDATE SET
                 entity = excluded.entity,
                 payload = excluded.payload,
                 updated_at = excluded.updated_at
             RETURNING id",
            rusqlite::params![Ulid::new().to_string(), source, source_id, entity, body, now],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

pub(crate) fn fmt_now() -> Result<String, StoreError> {
    format_rfc3339(now_utc()).map_err(StoreError::Core)
}

/// Wraps a domain parsing failure as a column conversion error so it can
/// surface through `rusqlite` row mappers.
pub(crate) fn column_error(index: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(CoreError::Validation(message.into())),
    )
}

pub(crate) fn parse_ulid_column(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    raw.parse::<Ulid>()
        .map_err(|err| column_error(index, format!("invalid ulid '{raw}': {err}")))
}

pub(crate) fn parse_json_column(index: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|err| column_error(index, format!("invalid json: {err}")))
}

pub(crate) fn parse_ts_column(
    index: usize,
    raw: &str,
) -> rusqlite::Result<time::OffsetDateTime> {
    etlguard_core::parse_rfc3339_utc(raw)
        .map_err(|err| column_error(index, format!("invalid timestamp '{raw}': {err}")))
}

pub(crate) fn parse_opt_ts_column(
    index: usize,
    raw: Option<&str>,
) -> rusqlite::Result<Option<time::OffsetDateTime>> {
    raw.map(|value| parse_ts_column(index, value)).transpose()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::SqliteWarehouse;

    pub fn fixture_store() -> SqliteWarehouse {
        match SqliteWarehouse::open_in_memory() {
            Ok(store) => store,
            Err(err) => panic!("open in-memory store: {err}"),
        }
    }

    pub fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    pub fn must_err<T, E>(result: Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        }
    }
}
